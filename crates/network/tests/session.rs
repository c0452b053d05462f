//! Tests de bout en bout de la session vocale
//!
//! Le service distant est joué par `SimulatedRemote`, le matériel par
//! `SimulatedDevices` : aucun réseau ni périphérique réel n'est nécessaire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use audio::{AudioFrame, SimulatedDevices, bytes_to_wire_text, float_to_pcm16};
use network::{
    Agent, ClientMessage, FailureKind, HostBindings, NetworkError, ServerMessage, SessionConfig,
    SessionState, SimulatedConnector, SimulatedRemote, ToolCallBatch, ToolCallRequest,
    VoiceSession,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_test::assert_ok;

const EPSILON: f64 = 1e-9;

/// Hôte de test : enregistre ce que la session lui demande
struct RecordingHost {
    devices: Arc<SimulatedDevices>,
    statuses: Mutex<Vec<String>>,
    volumes: Mutex<Vec<f32>>,
    units_at_snapshot: Mutex<Vec<usize>>,
}

impl RecordingHost {
    fn new(devices: Arc<SimulatedDevices>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            statuses: Mutex::new(Vec::new()),
            volumes: Mutex::new(Vec::new()),
            units_at_snapshot: Mutex::new(Vec::new()),
        })
    }

    fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostBindings for RecordingHost {
    fn navigate(&self, _view: &str) {}

    async fn snapshot_metrics(&self) -> Value {
        // Nombre de buffers déjà programmés au moment de l'appel
        let scheduled = self
            .devices
            .last_output()
            .map(|output| output.scheduled_units().len())
            .unwrap_or(0);
        self.units_at_snapshot.lock().unwrap().push(scheduled);
        json!({ "activeAgents": 4, "avgLatencyMs": 187.0 })
    }

    fn lookup_agents(&self) -> Vec<Agent> {
        vec![Agent::new("Finance Copilot", "active", 240.0)]
    }

    fn on_volume(&self, sample: f32) {
        self.volumes.lock().unwrap().push(sample);
    }

    fn on_status(&self, state: &SessionState) {
        self.statuses.lock().unwrap().push(state.to_string());
    }
}

struct Harness {
    session: Arc<VoiceSession>,
    remote: SimulatedRemote,
    devices: Arc<SimulatedDevices>,
    host: Arc<RecordingHost>,
}

fn harness_with(devices: SimulatedDevices, held: bool) -> Harness {
    let devices = Arc::new(devices);
    let (connector, remote) = if held {
        SimulatedConnector::held()
    } else {
        SimulatedConnector::new()
    };
    let host = RecordingHost::new(Arc::clone(&devices));
    let session = VoiceSession::with_host_tools(
        SessionConfig::test_config(),
        devices.clone(),
        Arc::new(connector),
        host.clone(),
    );

    Harness {
        session: Arc::new(session),
        remote,
        devices,
        host,
    }
}

fn harness() -> Harness {
    harness_with(SimulatedDevices::new(), false)
}

/// Morceau d'audio encodé comme le service l'envoie (24 kHz mono)
fn audio_chunk(seconds: f64) -> ServerMessage {
    let samples = vec![0.25; (seconds * 24000.0).round() as usize];
    ServerMessage::Audio(bytes_to_wire_text(&float_to_pcm16(&samples)))
}

fn tool_call(id: &str, name: &str, args: Value) -> ServerMessage {
    ServerMessage::ToolCall(ToolCallBatch::new(vec![ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        args,
    }]))
}

async fn eventually(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Condition jamais atteinte: {}", description);
}

async fn wait_terminal(session: &VoiceSession) -> SessionState {
    let mut status = session.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.is_terminal()))
        .await
        .expect("la session n'a pas terminé")
        .expect("canal d'état fermé")
        .clone();
    state
}

async fn next_message(remote: &mut SimulatedRemote) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(2), remote.next_client_message())
        .await
        .expect("aucun message du client")
        .expect("canal client fermé")
        .expect("message client invalide")
}

#[tokio::test]
async fn test_setup_sent_first_with_tool_declarations() {
    let mut h = harness();
    assert_ok!(h.session.connect().await);
    assert_eq!(h.session.state(), SessionState::Active);

    match next_message(&mut h.remote).await {
        ClientMessage::Setup(setup) => {
            assert_eq!(setup.generation_config.response_modalities, vec!["AUDIO".to_string()]);
            let names: Vec<String> = setup.tools[0]
                .function_declarations
                .iter()
                .map(|declaration| declaration.name.clone())
                .collect();
            assert_eq!(names, vec!["get_agent_status", "get_dashboard_metrics", "navigate_app"]);
        }
        other => panic!("Setup attendu, reçu {:?}", other.kind()),
    }

    h.session.disconnect().await;
}

#[tokio::test]
async fn test_audio_tool_call_audio_in_order() {
    let mut h = harness();
    assert_ok!(h.session.connect().await);
    assert_eq!(next_message(&mut h.remote).await.kind(), "setup");

    h.remote.send(&audio_chunk(0.1)).unwrap();
    h.remote.send(&tool_call("call-42", "get_dashboard_metrics", json!({}))).unwrap();
    h.remote.send(&audio_chunk(0.05)).unwrap();

    match next_message(&mut h.remote).await {
        ClientMessage::ToolResponse(batch) => {
            assert_eq!(batch.function_responses.len(), 1);
            assert_eq!(batch.function_responses[0].id, "call-42");
            assert_eq!(batch.function_responses[0].response.result["activeAgents"], 4);
        }
        other => panic!("Réponse d'outil attendue, reçu {:?}", other.kind()),
    }

    let output = h.devices.last_output().unwrap();
    eventually("deux buffers programmés", || output.scheduled_units().len() == 2).await;

    // Le premier morceau était programmé avant l'appel, le second après
    assert_eq!(*h.host.units_at_snapshot.lock().unwrap(), vec![1]);

    let units = output.scheduled_units();
    assert!(units[0].start_at >= 0.0);
    assert!((units[0].duration - 0.1).abs() < EPSILON);
    assert!((units[1].start_at - units[0].end_at()).abs() < EPSILON);

    // Une seule réponse pour ce lot
    assert!(h.remote.drain_client_messages().iter().all(|m| m.kind() != "toolResponse"));

    let stats = h.session.stats();
    assert_eq!(stats.audio_chunks_scheduled, 2);
    assert_eq!(stats.tool_calls_handled, 1);
    assert_eq!(stats.tool_responses_sent, 1);

    h.session.disconnect().await;
}

#[tokio::test]
async fn test_unknown_tool_and_agent_lookup() {
    let mut h = harness();
    assert_ok!(h.session.connect().await);
    next_message(&mut h.remote).await;

    h.remote
        .send(&ServerMessage::ToolCall(ToolCallBatch::new(vec![
            ToolCallRequest {
                id: "a".to_string(),
                name: "get_agent_status".to_string(),
                args: json!({ "agentName": "finance" }),
            },
            ToolCallRequest {
                id: "b".to_string(),
                name: "launch_rocket".to_string(),
                args: json!({}),
            },
        ])))
        .unwrap();

    match next_message(&mut h.remote).await {
        ClientMessage::ToolResponse(batch) => {
            let by_id = |id: &str| {
                batch
                    .function_responses
                    .iter()
                    .find(|response| response.id == id)
                    .map(|response| response.response.result.clone())
                    .unwrap()
            };
            assert_eq!(by_id("a")["found"], true);
            assert_eq!(by_id("a")["agent"]["name"], "Finance Copilot");
            assert_eq!(by_id("b")["status"], "unhandled");
        }
        other => panic!("Réponse d'outil attendue, reçu {:?}", other.kind()),
    }

    assert_eq!(h.session.state(), SessionState::Active);
    h.session.disconnect().await;
}

#[tokio::test]
async fn test_malformed_call_does_not_starve_its_batch() {
    let mut h = harness();
    assert_ok!(h.session.connect().await);
    next_message(&mut h.remote).await;

    h.remote.send_json(&json!({ "toolCall": { "functionCalls": [
        { "id": "ok-1", "name": "get_dashboard_metrics", "args": {} },
        { "id": "bad-2" }
    ] } }));

    match next_message(&mut h.remote).await {
        ClientMessage::ToolResponse(batch) => {
            let ids: Vec<&str> = batch.function_responses.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(ids, vec!["ok-1", "bad-2"]);
            assert_eq!(batch.function_responses[0].response.result["activeAgents"], 4);
            assert_eq!(batch.function_responses[1].response.result["status"], "error");
        }
        other => panic!("Réponse d'outil attendue, reçu {:?}", other.kind()),
    }

    assert_eq!(h.session.state(), SessionState::Active);
    assert_eq!(h.session.stats().protocol_errors, 1);
    h.session.disconnect().await;
}

/// Hôte dont les métriques restent bloquées jusqu'à l'ouverture de la barrière
struct GatedHost {
    gate: Notify,
    entered: AtomicBool,
}

#[async_trait]
impl HostBindings for GatedHost {
    fn navigate(&self, _view: &str) {}

    async fn snapshot_metrics(&self) -> Value {
        self.entered.store(true, Ordering::SeqCst);
        self.gate.notified().await;
        json!({ "activeAgents": 2 })
    }

    fn lookup_agents(&self) -> Vec<Agent> {
        Vec::new()
    }
}

#[tokio::test]
async fn test_suspended_tool_does_not_block_capture() {
    let frames = (0..100).map(|i| AudioFrame::silence(4096, i)).collect();
    let devices = Arc::new(
        SimulatedDevices::new().with_capture_frames(frames, Duration::from_millis(5)),
    );
    let (connector, mut remote) = SimulatedConnector::new();
    let host = Arc::new(GatedHost {
        gate: Notify::new(),
        entered: AtomicBool::new(false),
    });
    let session = VoiceSession::with_host_tools(
        SessionConfig::test_config(),
        devices,
        Arc::new(connector),
        host.clone(),
    );

    assert_ok!(session.connect().await);
    assert_eq!(next_message(&mut remote).await.kind(), "setup");

    remote.send(&tool_call("slow-1", "get_dashboard_metrics", json!({}))).unwrap();
    eventually("outil en cours", || host.entered.load(Ordering::SeqCst)).await;
    remote.drain_client_messages();

    // L'outil est suspendu : le microphone continue d'émettre
    for _ in 0..3 {
        assert_eq!(next_message(&mut remote).await.kind(), "media");
    }
    assert_eq!(session.stats().tool_responses_sent, 0);

    host.gate.notify_one();
    let response = loop {
        match next_message(&mut remote).await {
            ClientMessage::Media(_) => continue,
            other => break other,
        }
    };
    match response {
        ClientMessage::ToolResponse(batch) => {
            assert_eq!(batch.function_responses[0].id, "slow-1");
            assert_eq!(batch.function_responses[0].response.result["activeAgents"], 2);
        }
        other => panic!("Réponse d'outil attendue, reçu {:?}", other.kind()),
    }

    session.disconnect().await;
}

#[tokio::test]
async fn test_captured_frames_are_streamed() {
    let frames = vec![
        AudioFrame::new(vec![0.5; 4096], 0),
        AudioFrame::new(vec![-0.5; 4096], 1),
    ];
    let mut h = harness_with(
        SimulatedDevices::new().with_capture_frames(frames, Duration::from_millis(5)),
        false,
    );
    assert_ok!(h.session.connect().await);
    assert_eq!(next_message(&mut h.remote).await.kind(), "setup");

    for _ in 0..2 {
        match next_message(&mut h.remote).await {
            ClientMessage::Media(chunk) => {
                assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
                let bytes = audio::wire_text_to_bytes(&chunk.data).unwrap();
                assert_eq!(bytes.len(), 4096 * 2);
            }
            other => panic!("Frame attendue, reçu {:?}", other.kind()),
        }
    }

    let volumes = h.host.volumes.lock().unwrap().clone();
    assert_eq!(volumes.len(), 2);
    assert!(volumes.iter().all(|volume| (volume - 0.5).abs() < 1e-3));

    eventually("frames comptées", || h.session.stats().frames_sent == 2).await;
    h.session.disconnect().await;
}

#[tokio::test]
async fn test_double_disconnect_releases_once() {
    let h = harness();
    assert_ok!(h.session.connect().await);

    tokio::join!(h.session.disconnect(), h.session.disconnect());
    h.session.disconnect().await;

    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(h.devices.capture_releases(), 1);
    assert_eq!(h.devices.output_closes(), 1);
    assert!(h.remote.client_closed());
    assert_eq!(h.host.statuses(), vec!["CONNECTING", "ACTIVE", "CLOSING", "CLOSED"]);
}

#[tokio::test]
async fn test_disconnect_while_connecting() {
    let h = harness_with(SimulatedDevices::new(), true);

    let pending = tokio::spawn({
        let session = Arc::clone(&h.session);
        async move { session.connect().await }
    });

    // Les périphériques sont acquis, le canal reste en attente
    eventually("connexion en cours", || h.remote.connect_attempts() == 1).await;
    assert_eq!(h.session.state(), SessionState::Connecting);

    h.session.disconnect().await;
    h.session.disconnect().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(NetworkError::Cancelled)));
    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(h.devices.captures_opened(), 1);
    assert_eq!(h.devices.capture_releases(), 1);
    assert_eq!(h.devices.output_closes(), 1);

    // Le canal s'ouvre trop tard : rien ne repart
    h.remote.open();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_disconnect_during_slow_acquisition_waits_for_release() {
    let h = harness_with(
        SimulatedDevices::new().with_acquisition_delay(Duration::from_millis(100)),
        false,
    );

    let pending = tokio::spawn({
        let session = Arc::clone(&h.session);
        async move { session.connect().await }
    });
    eventually("acquisition en cours", || h.session.state() == SessionState::Connecting).await;

    h.session.disconnect().await;

    // Au retour de disconnect(), les périphériques ouverts entre-temps sont déjà rendus
    assert_eq!(h.session.state(), SessionState::Closed);
    assert_eq!(h.devices.captures_opened(), 1);
    assert_eq!(h.devices.capture_releases(), 1);
    assert_eq!(h.devices.output_closes(), 1);
    assert_eq!(h.remote.connect_attempts(), 0);

    assert!(matches!(pending.await.unwrap(), Err(NetworkError::Cancelled)));
}

#[tokio::test]
async fn test_device_failure_releases_partial_acquisition() {
    let h = harness_with(SimulatedDevices::new().failing_output(), false);

    let result = h.session.connect().await;

    assert!(matches!(result, Err(NetworkError::Device(_))));
    let state = h.session.state();
    assert_eq!(state.failure().map(|failure| failure.kind), Some(FailureKind::Device));
    assert_eq!(state.failure().unwrap().to_string(), "audio device unavailable");
    assert_eq!(h.devices.captures_opened(), 1);
    assert_eq!(h.devices.capture_releases(), 1);
    assert_eq!(h.devices.outputs_opened(), 0);
    assert_eq!(h.remote.connect_attempts(), 0);
}

#[tokio::test]
async fn test_microphone_denied() {
    let h = harness_with(SimulatedDevices::new().failing_capture(), false);

    assert!(matches!(h.session.connect().await, Err(NetworkError::Device(_))));
    assert_eq!(h.session.state().to_string(), "ERROR");
    assert_eq!(h.devices.outputs_opened(), 0);
}

#[tokio::test]
async fn test_dropped_connection_is_uplink_lost() {
    let h = harness();
    assert_ok!(h.session.connect().await);

    h.remote.drop_connection("connection reset by peer");

    let state = wait_terminal(&h.session).await;
    let failure = state.failure().expect("état ERROR attendu");
    assert_eq!(failure.kind, FailureKind::Channel);
    assert_eq!(failure.to_string(), "uplink lost");
    assert_eq!(h.devices.capture_releases(), 1);
    assert_eq!(h.devices.output_closes(), 1);

    // disconnect() après une erreur ne relance pas la fermeture
    h.session.disconnect().await;
    assert_eq!(h.devices.output_closes(), 1);
    assert!(h.session.state().failure().is_some());
}

#[tokio::test]
async fn test_broken_uplink_fails_session() {
    let frames = (0..20).map(|i| AudioFrame::silence(4096, i)).collect();
    let h = harness_with(
        SimulatedDevices::new().with_capture_frames(frames, Duration::from_millis(10)),
        false,
    );
    h.remote.break_uplink();

    // Le setup lui-même ne passe pas
    let result = h.session.connect().await;
    assert!(matches!(result, Err(NetworkError::Channel(_))));
    assert_eq!(
        h.session.state().failure().map(|failure| failure.kind),
        Some(FailureKind::Channel)
    );
    assert_eq!(h.devices.capture_releases(), 1);
}

#[tokio::test]
async fn test_uplink_lost_while_streaming() {
    let frames = (0..50).map(|i| AudioFrame::silence(4096, i)).collect();
    let mut h = harness_with(
        SimulatedDevices::new().with_capture_frames(frames, Duration::from_millis(10)),
        false,
    );
    assert_ok!(h.session.connect().await);
    assert_eq!(next_message(&mut h.remote).await.kind(), "setup");

    h.remote.break_uplink();

    let state = wait_terminal(&h.session).await;
    assert_eq!(state.failure().map(|failure| failure.kind), Some(FailureKind::Channel));
    assert_eq!(h.devices.capture_releases(), 1);
}

#[tokio::test]
async fn test_interrupted_stops_playback() {
    let mut h = harness();
    assert_ok!(h.session.connect().await);
    next_message(&mut h.remote).await;

    h.remote.send(&audio_chunk(0.2)).unwrap();
    h.remote.send(&audio_chunk(0.2)).unwrap();
    let output = h.devices.last_output().unwrap();
    eventually("deux buffers programmés", || output.scheduled_units().len() == 2).await;

    output.set_time(0.05);
    h.remote.send(&ServerMessage::Interrupted(true)).unwrap();
    eventually("lecture interrompue", || output.stopped_units().len() == 2).await;
    assert_eq!(output.active_count(), 0);

    // La reprise part de l'heure courante, pas de l'ancien curseur (0.4s)
    h.remote.send(&audio_chunk(0.1)).unwrap();
    eventually("reprise programmée", || output.scheduled_units().len() == 3).await;
    assert!((output.scheduled_units()[2].start_at - 0.05).abs() < EPSILON);
    assert_eq!(h.session.stats().interruptions, 1);

    h.session.disconnect().await;
}

#[tokio::test]
async fn test_contained_errors_keep_session_active() {
    let mut h = harness();
    assert_ok!(h.session.connect().await);
    next_message(&mut h.remote).await;

    h.remote.send_text("pas du json");
    h.remote.send_json(&json!({ "goAway": { "timeLeft": "10s" } }));
    h.remote.send_json(&json!({ "audio": "***" }));
    h.remote.send_json(&json!({ "audio": "AAEC" }));
    h.remote.send(&ServerMessage::TurnComplete(true)).unwrap();
    h.remote.send(&audio_chunk(0.1)).unwrap();

    let output = h.devices.last_output().unwrap();
    eventually("audio valide programmé", || output.scheduled_units().len() == 1).await;

    let stats = h.session.stats();
    assert_eq!(stats.protocol_errors, 2);
    assert_eq!(stats.codec_errors, 2);
    assert_eq!(stats.contained_errors(), 4);
    assert_eq!(h.session.state(), SessionState::Active);
    assert!(!h.host.statuses().contains(&"ERROR".to_string()));

    h.session.disconnect().await;
}

#[tokio::test]
async fn test_remote_close_ends_session() {
    let h = harness();
    assert_ok!(h.session.connect().await);

    h.remote.close();

    assert_eq!(wait_terminal(&h.session).await, SessionState::Closed);
    assert_eq!(h.devices.output_closes(), 1);
}

#[tokio::test]
async fn test_connect_only_from_idle() {
    let h = harness();
    assert_ok!(h.session.connect().await);

    assert!(matches!(
        h.session.connect().await,
        Err(NetworkError::InvalidState { .. })
    ));

    h.session.disconnect().await;
    assert!(matches!(
        h.session.connect().await,
        Err(NetworkError::InvalidState { .. })
    ));
    assert_eq!(h.devices.captures_opened(), 1);
}

#[tokio::test]
async fn test_no_playback_after_disconnect() {
    let mut h = harness();
    assert_ok!(h.session.connect().await);
    next_message(&mut h.remote).await;

    h.remote.send(&audio_chunk(0.5)).unwrap();
    let output = h.devices.last_output().unwrap();
    eventually("buffer programmé", || output.scheduled_units().len() == 1).await;

    h.session.disconnect().await;

    assert!(output.is_closed());
    assert_eq!(output.active_count(), 0);

    h.remote.send(&audio_chunk(0.1)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(output.scheduled_units().len(), 1);
}
