//! Traits abstraits pour la session vocale
//!
//! Ce module définit les interfaces aux frontières de la session :
//! - le canal duplex vers le service (WebSocket réel ou simulé)
//! - les callbacks fournis par l'application hôte
//! - les outils appelables par le service
//!
//! `#[async_trait]` permet d'avoir des fonctions async dans les traits.
//! `Send + Sync` indique que l'objet peut être partagé entre tâches.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Agent, NetworkResult, SessionState, ToolDispatchError};

/// Moitié émettrice du canal
#[async_trait]
pub trait OutboundChannel: Send {
    /// Envoie un message texte
    ///
    /// Retourne quand l'écriture est terminée.
    ///
    /// # Erreurs
    /// - `NetworkError::Closed` : canal déjà fermé
    /// - `NetworkError::WebSocket` / `Channel` : écriture impossible
    async fn send_text(&mut self, text: String) -> NetworkResult<()>;

    /// Ferme proprement le canal
    async fn close(&mut self) -> NetworkResult<()>;
}

/// Moitié réceptrice du canal
#[async_trait]
pub trait InboundChannel: Send {
    /// Attend le prochain message texte
    ///
    /// `None` signale une fermeture propre par le service ; `Some(Err(_))`
    /// une coupure.
    async fn next_text(&mut self) -> Option<NetworkResult<String>>;
}

/// Canal ouvert, séparé en deux moitiés indépendantes
pub struct ChannelPair {
    pub outbound: Box<dyn OutboundChannel>,
    pub inbound: Box<dyn InboundChannel>,
}

/// Ouvre le canal duplex vers le service
///
/// Implémentations :
/// - WebSocketConnector : WebSocket réel avec tokio-tungstenite
/// - SimulatedConnector : canal en mémoire piloté par le test
#[async_trait]
pub trait Connector: Send + Sync {
    /// Ouvre le canal ; retourne quand il est prêt ("open")
    ///
    /// # Arguments
    /// * `url` - URL complète, clé d'API incluse
    async fn connect(&self, url: &str) -> NetworkResult<ChannelPair>;
}

/// Callbacks fournis par l'application hôte
///
/// Fournis une fois avant `connect()` et partagés par toute la session.
#[async_trait]
pub trait HostBindings: Send + Sync {
    /// Change la vue affichée (sans attendre de résultat)
    fn navigate(&self, view: &str);

    /// Instantané des métriques du tableau de bord
    async fn snapshot_metrics(&self) -> Value;

    /// Liste courante des agents
    fn lookup_agents(&self) -> Vec<Agent>;

    /// Volume de la dernière frame capturée, une fois par frame
    ///
    /// Appelé depuis la tâche de capture : doit rester rapide.
    fn on_volume(&self, _sample: f32) {}

    /// Chaque changement d'état de la session
    fn on_status(&self, _state: &SessionState) {}
}

/// Outil appelable par le service distant
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Description présentée au service
    fn description(&self) -> String;

    /// Schéma JSON des arguments (None = sans argument)
    fn parameters(&self) -> Option<Value> {
        None
    }

    /// Exécute l'outil
    ///
    /// Peut attendre un travail asynchrone de l'hôte. Une erreur est
    /// convertie en réponse `status: "error"` par le registre.
    async fn call(&self, args: Value) -> Result<Value, ToolDispatchError>;
}
