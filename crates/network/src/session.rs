//! Session vocale temps réel
//!
//! Ce module implémente la machine d'états d'une conversation vocale avec le
//! service distant. Une session orchestre :
//! - l'acquisition du microphone et de la sortie audio (transition CONNECTING)
//! - le canal duplex (setup, frames audio sortantes, messages entrants)
//! - l'ordonnanceur de lecture et le registre d'outils
//! - une fermeture unique, quel que soit le chemin de sortie
//!
//! # Architecture
//! Trois tâches tournent pendant l'état ACTIVE :
//! - lecture : traite les messages entrants un par un, dans l'ordre
//! - écriture : seul propriétaire de la moitié émettrice du canal
//! - complétions : retire de l'ordonnanceur les buffers terminés
//!
//! Le microphone pousse ses frames dans la file d'écriture sans jamais
//! attendre le traitement d'un appel d'outil.
//!
//! Toutes les transitions passent par `SessionInner::transition`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use audio::{
    AudioCapture, AudioCodec, AudioError, CapturedFrame, DeviceProvider, FrameSink, OutputDevice,
    Pcm16Codec, PlaybackScheduler, bytes_to_wire_text,
};

use crate::{
    ChannelPair, ClientMessage, Connector, HostBindings, InboundChannel, NetworkError,
    NetworkResult, OutboundChannel, ServerMessage, SessionConfig, SessionFailure, SessionState,
    SessionStats, SetupPayload, ToolRegistry,
};

const CHANNEL_OPEN: &str = "l'ouverture du canal";

/// Session vocale avec le service distant
///
/// Une session par conversation : elle part de IDLE et se termine en CLOSED
/// ou ERROR. Pour réessayer, on crée une nouvelle session.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use network::{HostBindings, SessionConfig, VoiceSession, WebSocketConnector};
/// use audio::CpalDevices;
///
/// # async fn example(host: Arc<dyn HostBindings>) -> Result<(), Box<dyn std::error::Error>> {
/// let session = VoiceSession::with_host_tools(
///     SessionConfig::default(),
///     Arc::new(CpalDevices::new()),
///     Arc::new(WebSocketConnector::new()),
///     host,
/// );
///
/// session.connect().await?;
/// // ... conversation ...
/// session.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl VoiceSession {
    /// Crée une session avec un registre d'outils déjà rempli
    pub fn new(
        config: SessionConfig,
        devices: Arc<dyn DeviceProvider>,
        connector: Arc<dyn Connector>,
        host: Arc<dyn HostBindings>,
        tools: ToolRegistry,
    ) -> Self {
        let codec = Pcm16Codec::new(
            config.capture.audio.sample_rate,
            config.playback.sample_rate,
            config.playback.channels,
        );
        let (state, _) = watch::channel(SessionState::Idle);
        let (cancel, _) = watch::channel(false);

        Self {
            inner: Arc::new(SessionInner {
                config,
                session_id: fastrand::u32(1..=u32::MAX),
                devices,
                connector,
                host,
                tools,
                codec,
                state,
                cancel,
                resources: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Crée une session exposant les trois outils de l'application hôte
    pub fn with_host_tools(
        config: SessionConfig,
        devices: Arc<dyn DeviceProvider>,
        connector: Arc<dyn Connector>,
        host: Arc<dyn HostBindings>,
    ) -> Self {
        let tools = ToolRegistry::with_host_bindings(Arc::clone(&host));
        Self::new(config, devices, connector, host, tools)
    }

    /// Ouvre la session : IDLE -> CONNECTING -> ACTIVE
    ///
    /// Retourne quand le canal est ouvert et la capture démarrée.
    ///
    /// # Erreurs
    /// - `InvalidState` : la session n'est pas IDLE
    /// - `ConfigError` : configuration incohérente (l'état ne change pas)
    /// - `Device` : microphone ou sortie indisponible, ou acquisition trop lente (état ERROR)
    /// - `Channel` / `WebSocket` / `Timeout` : ouverture du canal impossible (état ERROR)
    /// - `Cancelled` : `disconnect()` appelé pendant l'ouverture (état CLOSED)
    pub async fn connect(&self) -> NetworkResult<()> {
        let inner = &self.inner;
        inner.config.validate().map_err(NetworkError::ConfigError)?;

        if inner
            .transition(|state| {
                matches!(state, SessionState::Idle).then_some(SessionState::Connecting)
            })
            .is_none()
        {
            return Err(NetworkError::invalid_state("connect", inner.current_state()));
        }

        match inner.establish().await {
            Ok(()) => Ok(()),
            // La fermeture appartient à disconnect()
            Err(NetworkError::Cancelled) => {
                info!(session = inner.session_id, "Connexion annulée");
                Err(NetworkError::Cancelled)
            }
            Err(e) if *inner.cancel.borrow() => {
                info!(session = inner.session_id, error = %e, "Connexion annulée");
                Err(NetworkError::Cancelled)
            }
            Err(e) => {
                let failure = failure_for(&e);
                error!(session = inner.session_id, error = %e, "Échec de la connexion");
                inner.shutdown(SessionState::Error(failure)).await;
                Err(e)
            }
        }
    }

    /// Ferme la session depuis n'importe quel état
    ///
    /// Idempotent : la libération des ressources n'a lieu qu'une fois, même
    /// en cas d'appels concurrents. Au retour, plus aucune frame n'est
    /// envoyée et plus rien n'est joué.
    pub async fn disconnect(&self) {
        self.inner.shutdown(SessionState::Closed).await;
    }

    /// État courant
    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    /// Abonnement aux changements d'état
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Instantané des statistiques
    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    pub fn session_id(&self) -> u32 {
        self.inner.session_id
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if self.inner.current_state().is_terminal() {
            return;
        }
        // Les tâches voient l'annulation même sans runtime pour la fermeture
        self.inner.cancel.send_replace(true);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move { inner.shutdown(SessionState::Closed).await });
        }
    }
}

/// Message en attente d'écriture sur le canal
struct Outgoing {
    kind: &'static str,
    text: String,
    /// Prévenu quand l'écriture est terminée
    ack: Option<oneshot::Sender<Result<(), String>>>,
}

/// Ressources possédées par la session entre CONNECTING et CLOSING
struct SessionResources {
    capture: Box<dyn AudioCapture>,
    output: Arc<dyn OutputDevice>,
    scheduler: Arc<PlaybackScheduler>,
    completions: JoinHandle<()>,
    link: Option<Link>,
}

/// Tâches du canal, présentes une fois ACTIVE
struct Link {
    queue: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Issue du traitement d'un message entrant
enum Flow {
    Continue,
    RemoteClosed,
    Failed(SessionFailure),
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    audio_chunks_received: AtomicU64,
    audio_chunks_scheduled: AtomicU64,
    tool_calls_handled: AtomicU64,
    tool_responses_sent: AtomicU64,
    interruptions: AtomicU64,
    protocol_errors: AtomicU64,
    codec_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            audio_chunks_received: self.audio_chunks_received.load(Ordering::Relaxed),
            audio_chunks_scheduled: self.audio_chunks_scheduled.load(Ordering::Relaxed),
            tool_calls_handled: self.tool_calls_handled.load(Ordering::Relaxed),
            tool_responses_sent: self.tool_responses_sent.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
        }
    }
}

struct SessionInner {
    config: SessionConfig,
    session_id: u32,
    devices: Arc<dyn DeviceProvider>,
    connector: Arc<dyn Connector>,
    host: Arc<dyn HostBindings>,
    tools: ToolRegistry,
    codec: Pcm16Codec,
    state: watch::Sender<SessionState>,
    /// Passe à true au début de la fermeture
    cancel: watch::Sender<bool>,
    resources: Mutex<Option<SessionResources>>,
    counters: Counters,
}

impl SessionInner {
    fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Applique une transition si `step` l'autorise depuis l'état courant
    ///
    /// Retourne l'état précédent, ou None si la transition est refusée.
    fn transition(
        &self,
        step: impl FnOnce(&SessionState) -> Option<SessionState>,
    ) -> Option<SessionState> {
        let mut change = None;
        self.state.send_if_modified(|state| match step(state) {
            Some(next) => {
                let previous = std::mem::replace(state, next.clone());
                change = Some((previous, next));
                true
            }
            None => false,
        });

        let (previous, next) = change?;
        info!(session = self.session_id, from = %previous, to = %next, "Transition");
        self.host.on_status(&next);
        Some(previous)
    }

    /// Future résolu quand la fermeture commence
    fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut cancel = self.cancel.subscribe();
        async move {
            let _ = cancel.wait_for(|cancelled| *cancelled).await;
        }
    }

    /// Exécute `future` sauf si la fermeture commence avant
    async fn until_cancelled<F: Future>(&self, future: F) -> NetworkResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(NetworkError::Cancelled),
            output = future => Ok(output),
        }
    }

    /// Étapes de CONNECTING : périphériques, canal, activation
    async fn establish(self: &Arc<Self>) -> NetworkResult<()> {
        self.acquire_into_slot().await?;

        info!(session = self.session_id, endpoint = %self.config.endpoint, "Ouverture du canal");
        let url = self.config.endpoint_url();
        let timeout = self.config.connect_timeout;
        let channel = match self
            .until_cancelled(tokio::time::timeout(timeout, self.connector.connect(&url)))
            .await?
        {
            Ok(result) => result?,
            Err(_) => return Err(NetworkError::timeout(CHANNEL_OPEN, timeout)),
        };

        self.activate(channel).await
    }

    /// Acquiert les périphériques et les confie à la session
    ///
    /// Le verrou des ressources est tenu pendant toute l'acquisition : une
    /// fermeture concurrente attend ici, puis trouve soit les ressources déjà
    /// libérées, soit rien. Elle ne rend jamais la main avant la libération.
    async fn acquire_into_slot(&self) -> NetworkResult<()> {
        let mut slot = self.resources.lock().await;
        let resources = self.acquire_devices().await?;

        if !matches!(self.current_state(), SessionState::Connecting) {
            self.release(resources).await;
            return Err(NetworkError::Cancelled);
        }
        *slot = Some(resources);
        Ok(())
    }

    /// Ouvre le microphone puis la sortie, sous délai maximal
    ///
    /// L'ouverture est bloquante et tourne hors du runtime. Si elle échoue à
    /// mi-chemin, ce qui a déjà été ouvert est libéré en sortant de portée.
    /// Au-delà du délai, la tâche bloquante est abandonnée et libère ce
    /// qu'elle finit par ouvrir.
    async fn acquire_devices(&self) -> NetworkResult<SessionResources> {
        let devices = Arc::clone(&self.devices);
        let capture_config = self.config.capture.clone();
        let playback_config = self.config.playback.clone();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let acquisition = tokio::task::spawn_blocking(move || {
            let capture = devices.open_capture(&capture_config)?;
            let output = devices.open_output(&playback_config, completions_tx)?;
            Ok::<_, AudioError>((capture, output))
        });

        let timeout = self.config.device_timeout;
        let (capture, output) = match tokio::time::timeout(timeout, acquisition).await {
            Ok(Ok(opened)) => opened?,
            Ok(Err(join_error)) => {
                return Err(AudioError::InitializationError(join_error.to_string()).into());
            }
            Err(_) => {
                return Err(AudioError::AcquisitionTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
        };

        debug!(
            session = self.session_id,
            capture = %capture.device_info(),
            output = %output.device_info(),
            "Périphériques acquis"
        );

        let scheduler = Arc::new(PlaybackScheduler::new(
            Arc::clone(&output),
            self.config.scheduler.clone(),
        ));
        let completions = tokio::spawn(Arc::clone(&scheduler).run_completions(completions_rx));

        Ok(SessionResources {
            capture,
            output,
            scheduler,
            completions,
            link: None,
        })
    }

    /// CONNECTING -> ACTIVE : setup, tâches du canal, capture
    async fn activate(self: &Arc<Self>, channel: ChannelPair) -> NetworkResult<()> {
        let ChannelPair { mut outbound, inbound } = channel;

        // Le setup part avant toute frame audio
        let setup = ClientMessage::Setup(SetupPayload::new(
            &self.config.model,
            self.config.system_instruction.as_deref(),
            self.config.voice.as_deref(),
            self.tools.declarations(),
        ));
        outbound.send_text(setup.to_text()?).await?;
        debug!(session = self.session_id, tools = ?self.tools.names(), "Setup envoyé");

        let mut slot = self.resources.lock().await;
        let Some(mut resources) = slot.take() else {
            drop(slot);
            let _ = outbound.close().await;
            return Err(NetworkError::Cancelled);
        };
        if self
            .transition(|state| {
                matches!(state, SessionState::Connecting).then_some(SessionState::Active)
            })
            .is_none()
        {
            *slot = Some(resources);
            drop(slot);
            let _ = outbound.close().await;
            return Err(NetworkError::Cancelled);
        }

        let (queue, queue_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(Arc::clone(self).write_loop(outbound, queue_rx));
        let reader = tokio::spawn(Arc::clone(self).read_loop(
            inbound,
            Arc::clone(&resources.scheduler),
            queue.clone(),
        ));

        let started = resources.capture.start(self.frame_sink(queue.clone())).await;
        resources.link = Some(Link { queue, reader, writer });
        *slot = Some(resources);
        drop(slot);

        started?;
        info!(session = self.session_id, "Session active");
        Ok(())
    }

    /// Sink du microphone : volume vers l'hôte, frame vers la file d'écriture
    fn frame_sink(&self, queue: mpsc::UnboundedSender<Outgoing>) -> FrameSink {
        let host = Arc::clone(&self.host);
        let mime_type = self.config.capture.audio.mime_type();

        Box::new(move |frame: CapturedFrame| {
            host.on_volume(frame.volume);

            let message = ClientMessage::media(mime_type.clone(), bytes_to_wire_text(&frame.pcm16));
            match message.to_text() {
                Ok(text) => {
                    // Une file fermée signifie que la session se termine
                    let _ = queue.send(Outgoing {
                        kind: message.kind(),
                        text,
                        ack: None,
                    });
                }
                Err(e) => warn!(sequence = frame.sequence_number, error = %e, "Frame non sérialisable"),
            }
        })
    }

    /// Tâche d'écriture : vide la file dans le canal
    async fn write_loop(
        self: Arc<Self>,
        mut outbound: Box<dyn OutboundChannel>,
        mut queue: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let cancelled = self.cancelled();
        tokio::pin!(cancelled);

        loop {
            let next = tokio::select! {
                biased;
                item = queue.recv() => item,
                _ = &mut cancelled => None,
            };
            let Some(item) = next else { break };

            if let Err(e) = self.write(outbound.as_mut(), item).await {
                error!(session = self.session_id, error = %e, "Envoi impossible");
                self.spawn_shutdown(SessionState::Error(SessionFailure::channel(e.to_string())));
                return;
            }
        }

        // Ce qui est déjà en file part avant la fermeture
        while let Ok(item) = queue.try_recv() {
            if self.write(outbound.as_mut(), item).await.is_err() {
                break;
            }
        }
        if let Err(e) = outbound.close().await {
            debug!(session = self.session_id, error = %e, "Fermeture du canal");
        }
    }

    async fn write(&self, outbound: &mut dyn OutboundChannel, item: Outgoing) -> NetworkResult<()> {
        let result = outbound.send_text(item.text).await;

        if result.is_ok() {
            match item.kind {
                "media" => Counters::bump(&self.counters.frames_sent, 1),
                "toolResponse" => Counters::bump(&self.counters.tool_responses_sent, 1),
                _ => {}
            }
        }
        if let Some(ack) = item.ack {
            let _ = ack.send(result.as_ref().map(|_| ()).map_err(ToString::to_string));
        }
        result
    }

    /// Tâche de lecture : un message à la fois, dans l'ordre d'arrivée
    async fn read_loop(
        self: Arc<Self>,
        mut inbound: Box<dyn InboundChannel>,
        scheduler: Arc<PlaybackScheduler>,
        queue: mpsc::UnboundedSender<Outgoing>,
    ) {
        let cancelled = self.cancelled();
        tokio::pin!(cancelled);

        loop {
            let flow = tokio::select! {
                biased;
                _ = &mut cancelled => return,
                flow = self.read_next(inbound.as_mut(), &scheduler, &queue) => flow,
            };

            match flow {
                Flow::Continue => {}
                Flow::RemoteClosed => {
                    info!(session = self.session_id, "Canal fermé par le service");
                    self.spawn_shutdown(SessionState::Closed);
                    return;
                }
                Flow::Failed(failure) => {
                    error!(session = self.session_id, error = %failure.message, "Session interrompue");
                    self.spawn_shutdown(SessionState::Error(failure));
                    return;
                }
            }
        }
    }

    async fn read_next(
        &self,
        inbound: &mut dyn InboundChannel,
        scheduler: &PlaybackScheduler,
        queue: &mpsc::UnboundedSender<Outgoing>,
    ) -> Flow {
        match inbound.next_text().await {
            None => Flow::RemoteClosed,
            Some(Err(e)) => Flow::Failed(SessionFailure::channel(e.to_string())),
            Some(Ok(text)) => self.handle_message(&text, scheduler, queue).await,
        }
    }

    /// Traite un message entrant
    ///
    /// Les erreurs de protocole et de codec sont contenues : le message est
    /// abandonné et la session continue.
    async fn handle_message(
        &self,
        text: &str,
        scheduler: &PlaybackScheduler,
        queue: &mpsc::UnboundedSender<Outgoing>,
    ) -> Flow {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session = self.session_id, error = %e, "Message ignoré");
                Counters::bump(&self.counters.protocol_errors, 1);
                return Flow::Continue;
            }
        };

        match message {
            ServerMessage::Audio(data) => self.play_chunk(&data, scheduler),
            ServerMessage::ToolCall(batch) => {
                if batch.is_empty() {
                    return Flow::Continue;
                }
                debug!(
                    session = self.session_id,
                    count = batch.len(),
                    malformed = batch.malformed.len(),
                    "Appels d'outils reçus"
                );
                if !batch.malformed.is_empty() {
                    Counters::bump(&self.counters.protocol_errors, batch.malformed.len() as u64);
                }

                let responses = self.tools.answer_batch(&batch).await;
                if responses.is_empty() {
                    return Flow::Continue;
                }
                Counters::bump(&self.counters.tool_calls_handled, responses.len() as u64);
                self.send_tool_responses(ClientMessage::tool_responses(responses), queue).await
            }
            ServerMessage::Interrupted(_) => {
                Counters::bump(&self.counters.interruptions, 1);
                let stopped = scheduler.stop_all();
                debug!(session = self.session_id, stopped, "Voix interrompue");
                Flow::Continue
            }
            ServerMessage::TurnComplete(_) => {
                debug!(session = self.session_id, "Fin du tour de parole");
                Flow::Continue
            }
            ServerMessage::SetupComplete(_) => {
                info!(session = self.session_id, "Setup accepté par le service");
                Flow::Continue
            }
        }
    }

    fn play_chunk(&self, data: &str, scheduler: &PlaybackScheduler) -> Flow {
        Counters::bump(&self.counters.audio_chunks_received, 1);

        let buffer = match self.codec.decode(data) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(session = self.session_id, error = %e, "Audio reçu ignoré");
                Counters::bump(&self.counters.codec_errors, 1);
                return Flow::Continue;
            }
        };
        if buffer.is_empty() {
            return Flow::Continue;
        }

        match scheduler.enqueue(&buffer) {
            Ok(_) => {
                Counters::bump(&self.counters.audio_chunks_scheduled, 1);
                Flow::Continue
            }
            Err(e) => Flow::Failed(SessionFailure::device(e.to_string())),
        }
    }

    /// Envoie les réponses et attend la fin de l'écriture
    async fn send_tool_responses(
        &self,
        message: ClientMessage,
        queue: &mpsc::UnboundedSender<Outgoing>,
    ) -> Flow {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(session = self.session_id, error = %e, "Réponses d'outils non sérialisables");
                Counters::bump(&self.counters.protocol_errors, 1);
                return Flow::Continue;
            }
        };

        let (ack, written) = oneshot::channel();
        let queued = queue.send(Outgoing {
            kind: message.kind(),
            text,
            ack: Some(ack),
        });
        if queued.is_err() {
            return Flow::Failed(SessionFailure::channel("file d'écriture fermée"));
        }

        match written.await {
            Ok(Ok(())) => Flow::Continue,
            Ok(Err(reason)) => Flow::Failed(SessionFailure::channel(reason)),
            Err(_) => Flow::Failed(SessionFailure::channel("file d'écriture fermée")),
        }
    }

    /// Ferme la session depuis une tâche interne
    ///
    /// La fermeture attend la fin des tâches : elle ne peut pas s'exécuter
    /// dans l'une d'elles.
    fn spawn_shutdown(self: &Arc<Self>, outcome: SessionState) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.shutdown(outcome).await });
    }

    /// Séquence de fermeture, exécutée une seule fois
    ///
    /// Le premier appelant fait passer la session en CLOSING et libère les
    /// ressources ; les suivants attendent l'état final.
    async fn shutdown(&self, outcome: SessionState) {
        self.cancel.send_replace(true);

        let previous = self.transition(|state| match state {
            SessionState::Idle => Some(SessionState::Closed),
            SessionState::Connecting | SessionState::Active => Some(SessionState::Closing),
            _ => None,
        });

        match previous {
            Some(SessionState::Idle) => return,
            Some(_) => {}
            None => {
                let mut state = self.state.subscribe();
                let _ = state.wait_for(SessionState::is_terminal).await;
                return;
            }
        }

        let resources = self.resources.lock().await.take();
        if let Some(resources) = resources {
            self.release(resources).await;
        }

        if let SessionState::Error(failure) = &outcome {
            error!(session = self.session_id, failure = %failure, detail = %failure.message, "Session en erreur");
        }
        self.transition(|_| Some(outcome));
    }

    /// Libère les ressources dans l'ordre : capture, lecture, sortie, canal
    async fn release(&self, mut resources: SessionResources) {
        let grace = self.config.shutdown_grace;

        resources.capture.stop().await;

        let (queue, writer) = match resources.link.take() {
            Some(link) => {
                join_or_abort("lecture", link.reader, grace).await;
                (Some(link.queue), Some(link.writer))
            }
            None => (None, None),
        };

        let stopped = resources.scheduler.stop_all();

        // La fermeture joint le thread du stream
        let output = Arc::clone(&resources.output);
        match tokio::task::spawn_blocking(move || output.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session = self.session_id, error = %e, "Fermeture de la sortie audio");
            }
            Err(e) => {
                warn!(session = self.session_id, error = %e, "Fermeture de la sortie interrompue");
            }
        }
        resources.completions.abort();

        drop(queue);
        if let Some(writer) = writer {
            join_or_abort("écriture", writer, grace).await;
        }

        info!(
            session = self.session_id,
            stopped,
            backlog_warnings = resources.capture.backlog_warnings(),
            "Ressources libérées"
        );
    }
}

/// Attend une tâche pendant `grace`, puis l'interrompt
async fn join_or_abort(name: &'static str, mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        warn!(task = name, "Tâche interrompue après le délai de grâce");
        task.abort();
        let _ = task.await;
    }
}

/// Classe un échec de connexion pour l'utilisateur
fn failure_for(error: &NetworkError) -> SessionFailure {
    match error {
        NetworkError::Device(_) => SessionFailure::device(error.to_string()),
        _ => SessionFailure::channel(error.to_string()),
    }
}
