//! Protocole de messages du service vocal
//!
//! Chaque message est un objet JSON à une seule clé, qui désigne son type.
//! Les deux sens sont modélisés par des enums étiquetées : tout message reçu
//! est soit un des types connus, soit une erreur de protocole.
//!
//! Sortants :
//! - `{"setup": {...}}` : configuration, envoyée une fois à l'ouverture
//! - `{"media": {"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}}`
//! - `{"toolResponse": {"functionResponses": [{"id", "name", "response": {"result"}}]}}`
//!
//! Entrants :
//! - `{"audio": "<base64 PCM16 24 kHz>"}`
//! - `{"toolCall": {"functionCalls": [{"id", "name", "args"}]}}`
//! - `{"interrupted": true}`, `{"turnComplete": true}`, `{"setupComplete": {}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{NetworkError, NetworkResult};

/// Message envoyé au service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    Media(MediaChunk),
    ToolResponse(ToolResponseBatch),
}

impl ClientMessage {
    /// Frame audio encodée
    pub fn media(mime_type: impl Into<String>, data: String) -> Self {
        ClientMessage::Media(MediaChunk {
            mime_type: mime_type.into(),
            data,
        })
    }

    /// Lot de réponses d'outils
    pub fn tool_responses(function_responses: Vec<ToolCallResponse>) -> Self {
        ClientMessage::ToolResponse(ToolResponseBatch { function_responses })
    }

    /// Sérialise en texte JSON pour le canal
    pub fn to_text(&self) -> NetworkResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Nom court du type (journaux)
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Setup(_) => "setup",
            ClientMessage::Media(_) => "media",
            ClientMessage::ToolResponse(_) => "toolResponse",
        }
    }
}

/// Morceau d'audio sortant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// PCM16 en base64
    pub data: String,
}

/// Configuration de session envoyée à l'ouverture du canal
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Texte structuré (consigne système)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

/// Groupe de déclarations d'outils
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Description d'un outil appelable par le service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// Schéma JSON des arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl SetupPayload {
    /// Construit la configuration initiale
    ///
    /// La réponse est toujours demandée en audio.
    pub fn new(
        model: &str,
        system_instruction: Option<&str>,
        voice: Option<&str>,
        declarations: Vec<FunctionDeclaration>,
    ) -> Self {
        let speech_config = voice.map(|voice_name| SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.to_string(),
                },
            },
        });

        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config,
            },
            system_instruction: system_instruction.map(|text| Content {
                parts: vec![TextPart { text: text.to_string() }],
            }),
            tools: if declarations.is_empty() {
                Vec::new()
            } else {
                vec![ToolSet { function_declarations: declarations }]
            },
        }
    }
}

/// Lot de réponses d'outils
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseBatch {
    pub function_responses: Vec<ToolCallResponse>,
}

/// Réponse à un appel d'outil, corrélée par `id`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    /// Reprend l'id de la requête
    pub id: String,
    pub name: String,
    pub response: ToolResult,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub result: Value,
}

impl ToolCallResponse {
    pub fn new(request: &ToolCallRequest, result: Value) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            response: ToolResult { result },
        }
    }
}

/// Message reçu du service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerMessage {
    /// Morceau de voix synthétique (PCM16 24 kHz en base64)
    Audio(String),

    /// Un ou plusieurs appels d'outils à exécuter
    ToolCall(ToolCallBatch),

    /// L'utilisateur a coupé la parole : la voix en cours doit s'arrêter
    Interrupted(bool),

    /// Fin du tour de parole du service
    TurnComplete(bool),

    /// Le service a accepté la configuration
    SetupComplete(Value),
}

impl ServerMessage {
    /// Décode un message texte reçu
    ///
    /// # Erreurs
    /// `NetworkError::Protocol` si le JSON est invalide ou le type inconnu
    pub fn parse(text: &str) -> NetworkResult<Self> {
        serde_json::from_str(text).map_err(|e| NetworkError::Protocol(e.to_string()))
    }

    pub fn to_text(&self) -> NetworkResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Nom court du type (journaux)
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Audio(_) => "audio",
            ServerMessage::ToolCall(_) => "toolCall",
            ServerMessage::Interrupted(_) => "interrupted",
            ServerMessage::TurnComplete(_) => "turnComplete",
            ServerMessage::SetupComplete(_) => "setupComplete",
        }
    }
}

/// Lot d'appels d'outils reçus dans un même message
///
/// Chaque entrée est décodée séparément : une entrée mal formée ne fait pas
/// rejeter le lot. Elle est rangée dans `malformed` pour recevoir une réponse
/// d'erreur si son id est lisible.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawToolCallBatch")]
pub struct ToolCallBatch {
    pub function_calls: Vec<ToolCallRequest>,
    #[serde(skip)]
    pub malformed: Vec<MalformedCall>,
}

impl ToolCallBatch {
    pub fn new(function_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            function_calls,
            malformed: Vec::new(),
        }
    }

    /// Nombre total d'entrées reçues
    pub fn len(&self) -> usize {
        self.function_calls.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lot tel qu'il arrive sur le canal, entrées non décodées
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolCallBatch {
    #[serde(default)]
    function_calls: Vec<Value>,
}

impl From<RawToolCallBatch> for ToolCallBatch {
    fn from(raw: RawToolCallBatch) -> Self {
        let mut batch = ToolCallBatch::new(Vec::new());
        for entry in raw.function_calls {
            match serde_json::from_value::<ToolCallRequest>(entry.clone()) {
                Ok(request) => batch.function_calls.push(request),
                Err(e) => batch.malformed.push(MalformedCall {
                    id: entry.get("id").and_then(Value::as_str).map(str::to_string),
                    name: entry.get("name").and_then(Value::as_str).map(str::to_string),
                    reason: e.to_string(),
                }),
            }
        }
        batch
    }
}

/// Entrée de `functionCalls` impossible à décoder
#[derive(Clone, Debug, PartialEq)]
pub struct MalformedCall {
    /// Absent : aucune réponse ne peut être corrélée
    pub id: Option<String>,
    pub name: Option<String>,
    pub reason: String,
}

/// Appel d'outil demandé par le service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Jeton opaque, à renvoyer tel quel dans la réponse
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_wire_shape() {
        let message = ClientMessage::media("audio/pcm;rate=16000", "AAEC".to_string());
        let value: Value = serde_json::from_str(&message.to_text().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({"media": {"mimeType": "audio/pcm;rate=16000", "data": "AAEC"}})
        );
    }

    #[test]
    fn test_tool_response_wire_shape() {
        let request = ToolCallRequest {
            id: "call-1".to_string(),
            name: "get_dashboard_metrics".to_string(),
            args: json!({}),
        };
        let message = ClientMessage::tool_responses(vec![ToolCallResponse::new(
            &request,
            json!({"activeAgents": 4}),
        )]);
        let value: Value = serde_json::from_str(&message.to_text().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({"toolResponse": {"functionResponses": [
                {"id": "call-1", "name": "get_dashboard_metrics", "response": {"result": {"activeAgents": 4}}}
            ]}})
        );
    }

    #[test]
    fn test_setup_wire_shape() {
        let setup = SetupPayload::new(
            "models/test",
            Some("Tu es l'assistant du tableau de bord."),
            Some("Puck"),
            vec![FunctionDeclaration {
                name: "navigate_app".to_string(),
                description: "Change de vue".to_string(),
                parameters: None,
            }],
        );
        let value: Value =
            serde_json::from_str(&ClientMessage::Setup(setup).to_text().unwrap()).unwrap();

        assert_eq!(value["setup"]["model"], "models/test");
        assert_eq!(value["setup"]["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(value["setup"]["systemInstruction"]["parts"][0]["text"], "Tu es l'assistant du tableau de bord.");
        assert_eq!(value["setup"]["tools"][0]["functionDeclarations"][0]["name"], "navigate_app");
    }

    #[test]
    fn test_setup_omits_empty_fields() {
        let setup = SetupPayload::new("models/test", None, None, Vec::new());
        let value = serde_json::to_value(ClientMessage::Setup(setup)).unwrap();

        assert!(value["setup"].get("systemInstruction").is_none());
        assert!(value["setup"].get("tools").is_none());
        assert!(value["setup"]["generationConfig"].get("speechConfig").is_none());
    }

    #[test]
    fn test_parse_server_messages() {
        assert_eq!(
            ServerMessage::parse(r#"{"audio": "AAAA"}"#).unwrap(),
            ServerMessage::Audio("AAAA".to_string())
        );
        assert_eq!(
            ServerMessage::parse(r#"{"interrupted": true}"#).unwrap(),
            ServerMessage::Interrupted(true)
        );

        let message = ServerMessage::parse(
            r#"{"toolCall": {"functionCalls": [{"id": "a1", "name": "get_agent_status", "args": {"agentName": "finance"}}, {"id": "a2", "name": "get_dashboard_metrics"}]}}"#,
        )
        .unwrap();
        match message {
            ServerMessage::ToolCall(batch) => {
                assert_eq!(batch.function_calls.len(), 2);
                assert!(batch.malformed.is_empty());
                assert_eq!(batch.function_calls[0].args["agentName"], "finance");
                assert_eq!(batch.function_calls[1].args, Value::Null);
            }
            other => panic!("Type inattendu: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_call_keeps_rest_of_batch() {
        let message = ServerMessage::parse(
            r#"{"toolCall": {"functionCalls": [{"id": "ok-1", "name": "get_dashboard_metrics", "args": {}}, {"id": "bad-2"}, {"name": "navigate_app"}]}}"#,
        )
        .unwrap();

        let ServerMessage::ToolCall(batch) = message else {
            panic!("toolCall attendu");
        };
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.function_calls.len(), 1);
        assert_eq!(batch.function_calls[0].id, "ok-1");
        assert_eq!(batch.malformed.len(), 2);
        assert_eq!(batch.malformed[0].id.as_deref(), Some("bad-2"));
        assert!(batch.malformed[0].reason.contains("name"));
        assert_eq!(batch.malformed[1].id, None);
        assert_eq!(batch.malformed[1].name.as_deref(), Some("navigate_app"));
    }

    #[test]
    fn test_unknown_message_is_protocol_error() {
        assert!(matches!(
            ServerMessage::parse(r#"{"goAway": {}}"#),
            Err(NetworkError::Protocol(_))
        ));
        assert!(matches!(ServerMessage::parse("pas du json"), Err(NetworkError::Protocol(_))));
    }
}
