//! Registre des outils appelables par le service distant
//!
//! Le service demande l'exécution d'actions locales par leur nom. Le registre
//! garantit qu'une réponse bien formée est toujours produite :
//! - outil inconnu : `{ "status": "unhandled" }`
//! - outil en erreur ou en panique : `{ "status": "error", "message": ... }`
//!
//! Une liaison manquante ou un handler défaillant ne fait donc jamais tomber
//! la session, et le service n'attend jamais une réponse qui ne viendra pas.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    FunctionDeclaration, HostBindings, ToolCallBatch, ToolCallRequest, ToolCallResponse,
    ToolDispatchError, ToolHandler, ToolResult,
};

/// Change la vue affichée par l'application
pub const NAVIGATE_APP: &str = "navigate_app";

/// Instantané des métriques du tableau de bord
pub const GET_DASHBOARD_METRICS: &str = "get_dashboard_metrics";

/// État d'un agent, recherché par nom
pub const GET_AGENT_STATUS: &str = "get_agent_status";

/// Agent affiché par le tableau de bord
///
/// Les champs inconnus sont conservés tels quels et renvoyés au service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub name: String,
    pub status: String,
    pub avg_latency_ms: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Agent {
    pub fn new(name: impl Into<String>, status: impl Into<String>, avg_latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: status.into(),
            avg_latency_ms,
            extra: Map::new(),
        }
    }

    /// Correspondance insensible à la casse sur une partie du nom
    pub fn matches(&self, query: &str) -> bool {
        self.name.to_lowercase().contains(&query.to_lowercase())
    }
}

/// Table nom -> outil
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registre des trois outils de l'application hôte
    pub fn with_host_bindings(host: Arc<dyn HostBindings>) -> Self {
        let mut registry = Self::new();
        registry.register(NAVIGATE_APP, NavigateTool { host: Arc::clone(&host) });
        registry.register(GET_DASHBOARD_METRICS, MetricsTool { host: Arc::clone(&host) });
        registry.register(GET_AGENT_STATUS, AgentStatusTool { host });
        registry
    }

    /// Associe un nom à un outil (remplace une liaison existante)
    pub fn register(&mut self, name: impl Into<String>, handler: impl ToolHandler + 'static) {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            debug!(tool = %name, "Outil remplacé");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Noms enregistrés, triés
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Déclarations envoyées au service à l'ouverture
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                let handler = self.handlers.get(&name)?;
                Some(FunctionDeclaration {
                    description: handler.description(),
                    parameters: handler.parameters(),
                    name,
                })
            })
            .collect()
    }

    /// Exécute un outil et produit toujours un résultat
    pub async fn dispatch(&self, name: &str, args: Value) -> Value {
        let Some(handler) = self.handlers.get(name).cloned() else {
            warn!(tool = name, "Outil non enregistré");
            return json!({ "status": "unhandled" });
        };

        let outcome = AssertUnwindSafe(handler.call(args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ToolDispatchError::Panicked { name: name.to_string() }));

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "Échec de l'outil");
                json!({ "status": "error", "message": e.to_string() })
            }
        }
    }

    /// Exécute un lot d'appels en parallèle
    ///
    /// Les réponses reprennent l'ordre des requêtes ; le service les corrèle
    /// de toute façon par id.
    pub async fn dispatch_batch(&self, requests: &[ToolCallRequest]) -> Vec<ToolCallResponse> {
        join_all(requests.iter().map(|request| async move {
            let result = self.dispatch(&request.name, request.args.clone()).await;
            ToolCallResponse::new(request, result)
        }))
        .await
    }

    /// Répond à tout un lot reçu, entrées mal formées comprises
    ///
    /// Une entrée mal formée reçoit `{ status: "error" }` ; sans id lisible,
    /// elle est ignorée faute de pouvoir corréler la réponse.
    pub async fn answer_batch(&self, batch: &ToolCallBatch) -> Vec<ToolCallResponse> {
        let mut responses = self.dispatch_batch(&batch.function_calls).await;

        for call in &batch.malformed {
            let Some(id) = &call.id else {
                warn!(reason = %call.reason, "Appel d'outil sans id ignoré");
                continue;
            };
            warn!(id = %id, reason = %call.reason, "Appel d'outil mal formé");
            let error = ToolDispatchError::MalformedCall(call.reason.clone());
            responses.push(ToolCallResponse {
                id: id.clone(),
                name: call.name.clone().unwrap_or_default(),
                response: ToolResult {
                    result: json!({ "status": "error", "message": error.to_string() }),
                },
            });
        }
        responses
    }
}

/// Outil défini par une closure asynchrone
///
/// # Example
/// ```rust
/// use network::{FnTool, ToolRegistry};
/// use serde_json::json;
///
/// let mut registry = ToolRegistry::new();
/// registry.register("ping", FnTool::new("Répond pong", |_args| async { Ok(json!("pong")) }));
/// ```
pub struct FnTool<F> {
    description: String,
    parameters: Option<Value>,
    call: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolDispatchError>> + Send,
{
    pub fn new(description: impl Into<String>, call: F) -> Self {
        Self {
            description: description.into(),
            parameters: None,
            call,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolDispatchError>> + Send,
{
    fn description(&self) -> String {
        self.description.clone()
    }

    fn parameters(&self) -> Option<Value> {
        self.parameters.clone()
    }

    async fn call(&self, args: Value) -> Result<Value, ToolDispatchError> {
        (self.call)(args).await
    }
}

/// Lit un argument texte obligatoire et non vide
fn required_str<'a>(args: &'a Value, key: &'static str) -> Result<&'a str, ToolDispatchError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ToolDispatchError::MissingArgument(key))
}

fn string_schema(key: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": { key: { "type": "string", "description": description } },
        "required": [key],
    })
}

struct NavigateTool {
    host: Arc<dyn HostBindings>,
}

#[async_trait]
impl ToolHandler for NavigateTool {
    fn description(&self) -> String {
        "Affiche une vue de l'application (par exemple dashboard, agents, analytics)".to_string()
    }

    fn parameters(&self) -> Option<Value> {
        Some(string_schema("view", "Nom de la vue à afficher"))
    }

    async fn call(&self, args: Value) -> Result<Value, ToolDispatchError> {
        let view = required_str(&args, "view")?;
        self.host.navigate(view);
        Ok(json!({ "success": true, "view": view }))
    }
}

struct MetricsTool {
    host: Arc<dyn HostBindings>,
}

#[async_trait]
impl ToolHandler for MetricsTool {
    fn description(&self) -> String {
        "Retourne les métriques courantes du tableau de bord".to_string()
    }

    async fn call(&self, _args: Value) -> Result<Value, ToolDispatchError> {
        Ok(self.host.snapshot_metrics().await)
    }
}

struct AgentStatusTool {
    host: Arc<dyn HostBindings>,
}

#[async_trait]
impl ToolHandler for AgentStatusTool {
    fn description(&self) -> String {
        "Retourne l'état d'un agent à partir d'une partie de son nom".to_string()
    }

    fn parameters(&self) -> Option<Value> {
        Some(string_schema("agentName", "Nom (ou partie du nom) de l'agent"))
    }

    async fn call(&self, args: Value) -> Result<Value, ToolDispatchError> {
        let query = required_str(&args, "agentName")?;

        match self.host.lookup_agents().into_iter().find(|agent| agent.matches(query)) {
            Some(agent) => {
                let agent = serde_json::to_value(agent)
                    .map_err(|e| ToolDispatchError::Handler(e.to_string()))?;
                Ok(json!({ "found": true, "agent": agent }))
            }
            None => Ok(json!({
                "found": false,
                "message": format!("Aucun agent ne correspond à \"{}\"", query),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerMessage;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestHost {
        views: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostBindings for TestHost {
        fn navigate(&self, view: &str) {
            self.views.lock().unwrap().push(view.to_string());
        }

        async fn snapshot_metrics(&self) -> Value {
            tokio::task::yield_now().await;
            json!({ "activeAgents": 3, "avgLatencyMs": 212.5 })
        }

        fn lookup_agents(&self) -> Vec<Agent> {
            vec![
                Agent::new("Support Triage", "active", 180.0),
                Agent::new("Finance Copilot", "idle", 240.0),
            ]
        }
    }

    fn registry() -> (Arc<TestHost>, ToolRegistry) {
        let host = Arc::new(TestHost::default());
        let registry = ToolRegistry::with_host_bindings(host.clone());
        (host, registry)
    }

    #[tokio::test]
    async fn test_agent_status_substring_match() {
        let (_host, registry) = registry();

        let result = registry
            .dispatch(GET_AGENT_STATUS, json!({ "agentName": "finance" }))
            .await;

        assert_eq!(result["found"], true);
        assert_eq!(result["agent"]["name"], "Finance Copilot");
        assert_eq!(result["agent"]["avgLatencyMs"], 240.0);
    }

    #[tokio::test]
    async fn test_agent_status_not_found() {
        let (_host, registry) = registry();

        let result = registry
            .dispatch(GET_AGENT_STATUS, json!({ "agentName": "inconnu" }))
            .await;

        assert_eq!(result["found"], false);
        assert!(result["message"].as_str().unwrap().contains("inconnu"));
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_unhandled() {
        let (_host, registry) = registry();
        let result = registry.dispatch("open_pod_bay_doors", json!({})).await;
        assert_eq!(result["status"], "unhandled");
    }

    #[tokio::test]
    async fn test_navigate_calls_host() {
        let (host, registry) = registry();

        let result = registry.dispatch(NAVIGATE_APP, json!({ "view": "analytics" })).await;

        assert_eq!(result, json!({ "success": true, "view": "analytics" }));
        assert_eq!(*host.views.lock().unwrap(), vec!["analytics".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_argument_is_error_result() {
        let (host, registry) = registry();

        let result = registry.dispatch(NAVIGATE_APP, json!({})).await;

        assert_eq!(result["status"], "error");
        assert!(result["message"].as_str().unwrap().contains("view"));
        assert!(host.views.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "broken",
            FnTool::new("Échoue toujours", |_| async {
                Err(ToolDispatchError::Handler("base indisponible".to_string()))
            }),
        );
        registry.register(
            "panics",
            FnTool::new("Panique", |_| async { panic!("boum") }),
        );

        let result = registry.dispatch("broken", Value::Null).await;
        assert_eq!(result, json!({ "status": "error", "message": "base indisponible" }));

        let result = registry.dispatch("panics", Value::Null).await;
        assert_eq!(result["status"], "error");
    }

    #[tokio::test]
    async fn test_batch_preserves_ids() {
        let (_host, registry) = registry();
        let requests = vec![
            ToolCallRequest {
                id: "b".to_string(),
                name: GET_DASHBOARD_METRICS.to_string(),
                args: Value::Null,
            },
            ToolCallRequest {
                id: "a".to_string(),
                name: "absent".to_string(),
                args: Value::Null,
            },
        ];

        let responses = registry.dispatch_batch(&requests).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, "b");
        assert_eq!(responses[0].response.result["activeAgents"], 3);
        assert_eq!(responses[1].id, "a");
        assert_eq!(responses[1].response.result["status"], "unhandled");
    }

    #[tokio::test]
    async fn test_answer_batch_covers_malformed_entries() {
        let (_host, registry) = registry();
        let ServerMessage::ToolCall(batch) = ServerMessage::parse(
            r#"{"toolCall": {"functionCalls": [{"id": "ok-1", "name": "get_dashboard_metrics", "args": {}}, {"id": "bad-2"}, {"args": {}}]}}"#,
        )
        .unwrap() else {
            panic!("toolCall attendu");
        };

        let responses = registry.answer_batch(&batch).await;

        let ids: Vec<&str> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ok-1", "bad-2"]);
        assert_eq!(responses[0].response.result["activeAgents"], 3);
        assert_eq!(responses[1].response.result["status"], "error");
        assert!(responses[1].response.result["message"].as_str().unwrap().contains("name"));
    }

    #[test]
    fn test_declarations() {
        let (_host, registry) = registry();
        let declarations = registry.declarations();

        let names: Vec<&str> = declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![GET_AGENT_STATUS, GET_DASHBOARD_METRICS, NAVIGATE_APP]);
        assert!(declarations[0].parameters.is_some());
        assert!(declarations[1].parameters.is_none());
    }

    #[test]
    fn test_agent_keeps_extra_fields() {
        let agent: Agent = serde_json::from_value(json!({
            "name": "Ops Sentinel",
            "status": "active",
            "avgLatencyMs": 95.0,
            "region": "eu-west"
        }))
        .unwrap();

        assert!(agent.matches("SENTINEL"));
        assert_eq!(agent.extra["region"], "eu-west");
        assert_eq!(serde_json::to_value(&agent).unwrap()["region"], "eu-west");
    }
}
