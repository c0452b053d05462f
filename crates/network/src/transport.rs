//! Canal duplex vers le service vocal
//!
//! Ce module fournit deux implémentations du trait Connector :
//! - `WebSocketConnector` : WebSocket (TLS) réel avec tokio-tungstenite
//! - `SimulatedConnector` : canal en mémoire, piloté par un `SimulatedRemote`
//!   qui joue le rôle du service dans les tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use crate::{
    ChannelPair, ClientMessage, Connector, InboundChannel, NetworkError, NetworkResult,
    OutboundChannel, ServerMessage,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connecteur WebSocket réel
///
/// # Example
/// ```rust,no_run
/// use network::{Connector, WebSocketConnector};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = WebSocketConnector::new().connect("wss://example.com/live").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> NetworkResult<ChannelPair> {
        let (stream, response) = connect_async(url).await?;
        info!(status = %response.status(), "WebSocket ouvert");

        let (sink, stream) = stream.split();
        Ok(ChannelPair {
            outbound: Box::new(WebSocketOutbound { sink }),
            inbound: Box::new(WebSocketInbound { stream }),
        })
    }
}

struct WebSocketOutbound {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl OutboundChannel for WebSocketOutbound {
    async fn send_text(&mut self, text: String) -> NetworkResult<()> {
        match self.sink.send(Message::Text(text)).await {
            Ok(()) => Ok(()),
            Err(WsError::AlreadyClosed | WsError::ConnectionClosed) => Err(NetworkError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> NetworkResult<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::AlreadyClosed | WsError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct WebSocketInbound {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl InboundChannel for WebSocketInbound {
    async fn next_text(&mut self) -> Option<NetworkResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                // Le service envoie parfois son JSON en trames binaires
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| NetworkError::Protocol(format!("trame binaire non UTF-8: {}", e))),
                    );
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Fermeture demandée par le service");
                    return None;
                }
                // Ping/pong gérés par tungstenite
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// État de la porte d'ouverture du canal simulé
#[derive(Clone, Debug, PartialEq)]
enum Gate {
    Open,
    Held,
    Fail(String),
}

/// Événement côté service simulé
enum RemoteEvent {
    Text(String),
    Close,
    Drop(String),
}

/// Extrémités du canal, prises par la première connexion
struct PendingChannel {
    from_remote: mpsc::UnboundedReceiver<RemoteEvent>,
    to_remote: mpsc::UnboundedSender<String>,
}

/// Connecteur en mémoire pour les tests
///
/// Une seule connexion par connecteur. Tant que la porte est tenue
/// (`SimulatedConnector::held`), `connect` reste en attente : c'est l'état
/// CONNECTING vu par la session.
pub struct SimulatedConnector {
    gate: watch::Receiver<Gate>,
    pending: Mutex<Option<PendingChannel>>,
    uplink_broken: Arc<AtomicBool>,
    client_closed: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

/// Service simulé : injecte des messages et lit ceux du client
pub struct SimulatedRemote {
    gate: watch::Sender<Gate>,
    to_client: mpsc::UnboundedSender<RemoteEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
    uplink_broken: Arc<AtomicBool>,
    client_closed: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl SimulatedConnector {
    /// Canal qui s'ouvre immédiatement
    pub fn new() -> (Self, SimulatedRemote) {
        Self::with_gate(Gate::Open)
    }

    /// Canal qui reste en attente jusqu'à `SimulatedRemote::open` ou `fail`
    pub fn held() -> (Self, SimulatedRemote) {
        Self::with_gate(Gate::Held)
    }

    fn with_gate(initial: Gate) -> (Self, SimulatedRemote) {
        let (gate_tx, gate_rx) = watch::channel(initial);
        let (to_client, from_remote) = mpsc::unbounded_channel();
        let (to_remote, from_client) = mpsc::unbounded_channel();
        let uplink_broken = Arc::new(AtomicBool::new(false));
        let client_closed = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));

        let connector = Self {
            gate: gate_rx,
            pending: Mutex::new(Some(PendingChannel { from_remote, to_remote })),
            uplink_broken: Arc::clone(&uplink_broken),
            client_closed: Arc::clone(&client_closed),
            attempts: Arc::clone(&attempts),
        };
        let remote = SimulatedRemote {
            gate: gate_tx,
            to_client,
            from_client,
            uplink_broken,
            client_closed,
            attempts,
        };
        (connector, remote)
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self, _url: &str) -> NetworkResult<ChannelPair> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.clone();
        let decision = gate
            .wait_for(|gate| *gate != Gate::Held)
            .await
            .map_err(|_| NetworkError::Channel("service simulé disparu".to_string()))?
            .clone();
        if let Gate::Fail(reason) = decision {
            return Err(NetworkError::Channel(reason));
        }

        let pending = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| NetworkError::Channel("canal simulé déjà utilisé".to_string()))?;

        Ok(ChannelPair {
            outbound: Box::new(SimulatedOutbound {
                to_remote: pending.to_remote,
                uplink_broken: Arc::clone(&self.uplink_broken),
                client_closed: Arc::clone(&self.client_closed),
            }),
            inbound: Box::new(SimulatedInbound {
                from_remote: pending.from_remote,
            }),
        })
    }
}

struct SimulatedOutbound {
    to_remote: mpsc::UnboundedSender<String>,
    uplink_broken: Arc<AtomicBool>,
    client_closed: Arc<AtomicBool>,
}

#[async_trait]
impl OutboundChannel for SimulatedOutbound {
    async fn send_text(&mut self, text: String) -> NetworkResult<()> {
        if self.uplink_broken.load(Ordering::SeqCst) {
            return Err(NetworkError::Channel("broken pipe (simulation)".to_string()));
        }
        if self.client_closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        self.to_remote.send(text).map_err(|_| NetworkError::Closed)
    }

    async fn close(&mut self) -> NetworkResult<()> {
        self.client_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SimulatedInbound {
    from_remote: mpsc::UnboundedReceiver<RemoteEvent>,
}

#[async_trait]
impl InboundChannel for SimulatedInbound {
    async fn next_text(&mut self) -> Option<NetworkResult<String>> {
        match self.from_remote.recv().await? {
            RemoteEvent::Text(text) => Some(Ok(text)),
            RemoteEvent::Close => None,
            RemoteEvent::Drop(reason) => Some(Err(NetworkError::Channel(reason))),
        }
    }
}

impl SimulatedRemote {
    /// Laisse passer la connexion en attente
    pub fn open(&self) {
        self.gate.send_replace(Gate::Open);
    }

    /// Fait échouer la connexion en attente
    pub fn fail(&self, reason: &str) {
        self.gate.send_replace(Gate::Fail(reason.to_string()));
    }

    /// Envoie un texte brut au client (même invalide)
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(RemoteEvent::Text(text.into()));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    pub fn send(&self, message: &ServerMessage) -> NetworkResult<()> {
        self.send_text(message.to_text()?);
        Ok(())
    }

    /// Fermeture propre côté service
    pub fn close(&self) {
        let _ = self.to_client.send(RemoteEvent::Close);
    }

    /// Coupure brutale côté service
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.to_client.send(RemoteEvent::Drop(reason.to_string()));
    }

    /// Les envois du client échouent désormais
    pub fn break_uplink(&self) {
        self.uplink_broken.store(true, Ordering::SeqCst);
    }

    /// Prochain message du client, décodé
    ///
    /// `None` quand le client a abandonné son émetteur.
    pub async fn next_client_message(&mut self) -> Option<NetworkResult<ClientMessage>> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).map_err(NetworkError::from))
    }

    /// Messages déjà reçus, sans attendre
    pub fn drain_client_messages(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(message) = serde_json::from_str(&text) {
                messages.push(message);
            }
        }
        messages
    }

    /// Le client a fermé son côté du canal
    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }

    /// Nombre d'appels à `connect`
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}
