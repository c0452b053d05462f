//! Types de données pour la session vocale
//!
//! Ce module définit les structures principales de la session :
//! - SessionState : machine d'états de la connexion
//! - SessionConfig : configuration de la session
//! - SessionStats : statistiques et métriques

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use audio::{AudioConfig, CaptureConfig, SchedulerConfig};

/// Origine d'un échec fatal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Microphone ou haut-parleurs indisponibles
    Device,
    /// Canal duplex perdu
    Channel,
}

/// Échec fatal d'une session, présenté à l'utilisateur avec une option de réessai
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    /// Détail technique (journaux)
    pub message: String,
}

impl SessionFailure {
    pub fn device(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Device,
            message: message.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Channel,
            message: message.into(),
        }
    }
}

impl fmt::Display for SessionFailure {
    /// Texte destiné à l'utilisateur
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Device => write!(f, "audio device unavailable"),
            FailureKind::Channel => write!(f, "uplink lost"),
        }
    }
}

/// États de la session
///
/// ```text
/// IDLE -> CONNECTING -> ACTIVE -> CLOSING -> CLOSED
///              |           |
///              +-----------+--> ERROR
/// ```
///
/// `Error` est terminal comme `Closed` ; il est distingué pour que l'interface
/// propose de réessayer.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
    Error(SessionFailure),
}

impl SessionState {
    /// Vérifie si la session est terminée (fermée ou en erreur)
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error(_))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// Échec associé, si la session est en erreur
    pub fn failure(&self) -> Option<&SessionFailure> {
        match self {
            SessionState::Error(failure) => Some(failure),
            _ => None,
        }
    }

    /// Description textuelle de l'état pour l'UI
    pub fn description(&self) -> String {
        match self {
            SessionState::Idle => "Prêt".to_string(),
            SessionState::Connecting => "Connexion...".to_string(),
            SessionState::Active => "En conversation".to_string(),
            SessionState::Closing => "Fermeture...".to_string(),
            SessionState::Closed => "Terminée".to_string(),
            SessionState::Error(failure) => format!("Erreur : {} (réessayer)", failure),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Connecting => "CONNECTING",
            SessionState::Active => "ACTIVE",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
            SessionState::Error(_) => "ERROR",
        };
        f.write_str(name)
    }
}

/// Point d'accès par défaut du service de conversation vocale
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Modèle par défaut
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Configuration de la session
///
/// Centralise tous les paramètres de la session vocale. Les champs absents
/// d'un fichier de configuration prennent leur valeur par défaut ; la clé
/// d'API n'est jamais écrite.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// URL WebSocket du service (ws:// ou wss://)
    pub endpoint: String,

    /// Clé d'API, ajoutée en paramètre `key` de l'URL
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Modèle demandé dans le message de configuration
    pub model: String,

    /// Consigne système envoyée au démarrage
    pub system_instruction: Option<String>,

    /// Voix de synthèse préférée
    pub voice: Option<String>,

    /// Pipeline de capture (16 kHz mono, frames de 4096)
    pub capture: CaptureConfig,

    /// Format de l'audio reçu (24 kHz mono)
    pub playback: AudioConfig,

    pub scheduler: SchedulerConfig,

    /// Délai maximal d'acquisition des périphériques (défaut: 5s)
    ///
    /// Un dialogue de permission sans réponse ne doit pas bloquer `connect()`.
    pub device_timeout: Duration,

    /// Délai maximal d'ouverture du canal (défaut: 10s)
    pub connect_timeout: Duration,

    /// Temps laissé aux tâches pour finir proprement à la fermeture (défaut: 500ms)
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            system_instruction: None,
            voice: None,
            capture: CaptureConfig::default(),
            playback: AudioConfig::playback(),
            scheduler: SchedulerConfig::default(),
            device_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    /// Configuration pour tests (délais raccourcis)
    pub fn test_config() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9/test".to_string(),
            device_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    /// URL effective, clé d'API incluse
    pub fn endpoint_url(&self) -> String {
        match &self.api_key {
            Some(key) if !key.is_empty() => {
                let separator = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.endpoint, separator, key)
            }
            _ => self.endpoint.clone(),
        }
    }

    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(format!("Endpoint invalide: {} (ws:// ou wss:// attendu)", self.endpoint));
        }

        if self.model.trim().is_empty() {
            return Err("Le modèle ne peut pas être vide".to_string());
        }

        self.capture.validate()?;
        self.playback.validate()?;

        if self.device_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err("Les délais de connexion doivent être non nuls".to_string());
        }

        Ok(())
    }
}

/// Statistiques de la session
///
/// Les erreurs contenues (protocole, codec) ne changent pas l'état visible :
/// elles ne sont visibles qu'ici et dans les journaux.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames audio envoyées au service
    pub frames_sent: u64,

    /// Morceaux d'audio reçus
    pub audio_chunks_received: u64,

    /// Morceaux d'audio programmés sur la sortie
    pub audio_chunks_scheduled: u64,

    /// Appels d'outils traités
    pub tool_calls_handled: u64,

    /// Lots de réponses d'outils envoyés
    pub tool_responses_sent: u64,

    /// Interruptions de la voix (prise de parole de l'utilisateur)
    pub interruptions: u64,

    /// Messages reçus mal formés ou inconnus
    pub protocol_errors: u64,

    /// Audio reçu non décodable
    pub codec_errors: u64,
}

impl SessionStats {
    /// Total des erreurs contenues
    pub fn contained_errors(&self) -> u64 {
        self.protocol_errors + self.codec_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "IDLE");
        assert_eq!(SessionState::Closing.to_string(), "CLOSING");
        assert_eq!(
            SessionState::Error(SessionFailure::channel("reset")).to_string(),
            "ERROR"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Error(SessionFailure::device("micro")).is_terminal());
        assert!(!SessionState::Closing.is_terminal());
        assert!(!SessionState::Active.is_terminal());
    }

    #[test]
    fn test_failure_shown_to_user() {
        let failure = SessionFailure::channel("connection reset by peer");
        assert_eq!(failure.to_string(), "uplink lost");

        let state = SessionState::Error(failure.clone());
        assert_eq!(state.failure(), Some(&failure));
        assert!(state.description().contains("uplink lost"));
    }

    #[test]
    fn test_endpoint_url_with_key() {
        let mut config = SessionConfig::default();
        assert_eq!(config.endpoint_url(), DEFAULT_ENDPOINT);

        config.api_key = Some("abc123".to_string());
        assert_eq!(config.endpoint_url(), format!("{}?key=abc123", DEFAULT_ENDPOINT));

        config.endpoint = "ws://localhost:8080/live?alt=1".to_string();
        assert_eq!(config.endpoint_url(), "ws://localhost:8080/live?alt=1&key=abc123");
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: SessionConfig = serde_json::from_value(serde_json::json!({
            "model": "models/test",
            "api_key": "secret",
            "voice": "Puck"
        }))
        .unwrap();

        assert_eq!(config.model, "models/test");
        assert_eq!(config.voice.as_deref(), Some("Puck"));
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.device_timeout, Duration::from_secs(5));

        let written = serde_json::to_value(&config).unwrap();
        assert!(written.get("api_key").is_none());
        assert_eq!(written["playback"]["sample_rate"], 24000);
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::test_config().validate().is_ok());

        let mut config = SessionConfig::test_config();
        config.endpoint = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = SessionConfig::test_config();
        config.device_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stats_contained_errors() {
        let stats = SessionStats {
            protocol_errors: 2,
            codec_errors: 1,
            ..Default::default()
        };
        assert_eq!(stats.contained_errors(), 3);
    }
}
