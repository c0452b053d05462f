//! Crate network - Session vocale temps réel avec un service distant
//!
//! Ce crate relie le crate audio à un service de conversation vocale via un
//! canal duplex (WebSocket), et exécute les outils que le service demande.
//!
//! # Architecture
//!
//! Le crate est organisé en plusieurs modules :
//!
//! - `error` : Erreurs fatales (périphérique, canal) et contenues (protocole, outil)
//! - `types` : États de session, configuration, statistiques
//! - `protocol` : Messages JSON échangés avec le service
//! - `traits` : Canal duplex, callbacks de l'hôte, outils
//! - `transport` : Canal WebSocket réel et canal simulé
//! - `tools` : Registre d'outils et outils de l'application hôte
//! - `session` : Machine d'états de la session
//!
//! # Examples
//!
//! ## Session réelle
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use network::{HostBindings, SessionConfig, VoiceSession, WebSocketConnector};
//! use audio::CpalDevices;
//!
//! # async fn example(host: Arc<dyn HostBindings>) -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SessionConfig::default();
//! config.api_key = std::env::var("VOICE_API_KEY").ok();
//!
//! let session = VoiceSession::with_host_tools(
//!     config,
//!     Arc::new(CpalDevices::new()),
//!     Arc::new(WebSocketConnector::new()),
//!     host,
//! );
//!
//! session.connect().await?;
//! let mut status = session.subscribe();
//! status.wait_for(|state| state.is_terminal()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Tests et simulation
//!
//! ```rust
//! use network::{SimulatedConnector, ServerMessage};
//!
//! // Canal en mémoire : le test joue le rôle du service
//! let (connector, remote) = SimulatedConnector::new();
//! remote.send(&ServerMessage::TurnComplete(true)).unwrap();
//! # drop(connector);
//! ```

// Modules internes
mod error;
mod types;
mod protocol;
mod traits;
mod transport;
mod tools;
mod session;

// Re-exports publics
pub use error::{NetworkError, NetworkResult, ToolDispatchError};

pub use types::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, FailureKind, SessionConfig, SessionFailure, SessionState,
    SessionStats,
};

pub use protocol::{
    ClientMessage, Content, FunctionDeclaration, GenerationConfig, MalformedCall, MediaChunk,
    PrebuiltVoiceConfig, ServerMessage, SetupPayload, SpeechConfig, TextPart, ToolCallBatch,
    ToolCallRequest, ToolCallResponse, ToolResponseBatch, ToolResult, ToolSet, VoiceConfig,
};

pub use traits::{
    ChannelPair, Connector, HostBindings, InboundChannel, OutboundChannel, ToolHandler,
};

pub use transport::{SimulatedConnector, SimulatedRemote, WebSocketConnector};

pub use tools::{Agent, FnTool, GET_AGENT_STATUS, GET_DASHBOARD_METRICS, NAVIGATE_APP, ToolRegistry};

pub use session::VoiceSession;

/// Version du crate network
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fonctions utilitaires pour l'utilisateur final
pub mod utils {
    /// Formate une durée de façon lisible
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    /// use std::time::Duration;
    ///
    /// assert_eq!(utils::format_duration(Duration::from_millis(1234)), "1.23s");
    /// assert_eq!(utils::format_duration(Duration::from_millis(56)), "56ms");
    /// ```
    pub fn format_duration(duration: std::time::Duration) -> String {
        let ms = duration.as_millis();

        if ms >= 1000 {
            format!("{:.2}s", ms as f64 / 1000.0)
        } else {
            format!("{}ms", ms)
        }
    }

    /// Masque la clé d'API d'une URL avant de l'afficher
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    ///
    /// assert_eq!(utils::redact_key("wss://h/live?key=secret"), "wss://h/live?key=***");
    /// assert_eq!(utils::redact_key("ws://localhost:8080"), "ws://localhost:8080");
    /// ```
    pub fn redact_key(url: &str) -> String {
        let Some(start) = url.find("key=").map(|index| index + "key=".len()) else {
            return url.to_string();
        };
        let end = url[start..].find('&').map(|offset| start + offset).unwrap_or(url.len());
        format!("{}***{}", &url[..start], &url[end..])
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_utility_functions() {
        assert_eq!(utils::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(
            utils::redact_key("wss://h/live?key=abc&alt=json"),
            "wss://h/live?key=***&alt=json"
        );
    }

    #[test]
    fn test_default_config_targets_service() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.capture.audio.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(config.playback.sample_rate, 24000);
    }
}
