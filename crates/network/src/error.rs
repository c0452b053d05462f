//! Gestion d'erreurs pour la session vocale
//!
//! Ce module définit les erreurs possibles côté canal et session.
//! Il suit les mêmes patterns que le module audio pour la cohérence du code.
//!
//! Deux catégories se distinguent :
//! - fatales (périphérique, canal) : elles mettent fin à la session
//! - contenues (protocole, codec, outil) : journalisées, la session continue

use thiserror::Error;

use audio::{AudioError, CodecError};

/// Énumération de toutes les erreurs possibles côté session
///
/// `thiserror::Error` génère automatiquement l'implémentation du trait Error
/// avec des messages d'erreur descriptifs en français.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Acquisition ou pilotage d'un périphérique audio impossible
    #[error("Erreur périphérique: {0}")]
    Device(#[from] AudioError),

    /// Le canal duplex a échoué (coupure, envoi impossible)
    #[error("Erreur de canal: {0}")]
    Channel(String),

    /// Le canal est fermé, plus rien ne peut y transiter
    #[error("Canal fermé")]
    Closed,

    /// Erreur remontée par la couche WebSocket
    #[error("Erreur WebSocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message reçu mal formé ou de type inconnu
    #[error("Message invalide: {0}")]
    Protocol(String),

    /// Erreur lors de la sérialisation/désérialisation JSON
    #[error("Erreur de sérialisation: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Audio reçu non décodable
    #[error("Audio reçu invalide: {0}")]
    Codec(#[from] CodecError),

    /// Une étape n'a pas abouti dans le délai imparti
    #[error("Timeout pendant {operation} après {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    /// Opération tentée alors que la session n'est pas dans le bon état
    #[error("Opération {operation} invalide dans l'état {current_state}")]
    InvalidState { operation: String, current_state: String },

    /// La connexion a été annulée par `disconnect()`
    #[error("Connexion annulée")]
    Cancelled,

    /// Erreur de configuration de la session
    #[error("Configuration invalide: {0}")]
    ConfigError(String),
}

/// Type Result personnalisé pour notre crate network
///
/// Au lieu d'écrire Result<T, NetworkError> partout, on peut écrire NetworkResult<T>
pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// Crée une erreur d'état invalide avec contexte
    pub fn invalid_state(operation: &str, current_state: impl ToString) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            current_state: current_state.to_string(),
        }
    }

    /// Crée une erreur de timeout à partir d'une durée
    pub fn timeout(operation: &'static str, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            timeout_ms: duration.as_millis() as u64,
        }
    }

    /// Vérifie si l'erreur met fin à la session
    pub fn is_fatal(&self) -> bool {
        match self {
            NetworkError::Device(_) => true,
            NetworkError::Channel(_) => true,
            NetworkError::Closed => true,
            NetworkError::WebSocket(_) => true,
            NetworkError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Vérifie si l'erreur concerne le matériel audio
    pub fn is_device_error(&self) -> bool {
        matches!(self, NetworkError::Device(_))
    }
}

/// Erreur levée par un outil appelé par le service distant
///
/// Elle n'est jamais propagée : le registre la convertit en réponse
/// `{ status: "error", message }` renvoyée au service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolDispatchError {
    /// Un argument obligatoire manque ou n'a pas le bon type
    #[error("Argument manquant ou invalide: {0}")]
    MissingArgument(&'static str),

    /// Le handler a échoué
    #[error("{0}")]
    Handler(String),

    /// Le handler a paniqué
    #[error("L'outil {name} a paniqué")]
    Panicked { name: String },

    /// L'appel reçu n'a pas pu être décodé
    #[error("Appel d'outil mal formé: {0}")]
    MalformedCall(String),
}
