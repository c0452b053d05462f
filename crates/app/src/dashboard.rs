// Tableau de bord de démonstration
//
// Fournit à la session vocale les trois callbacks de l'application hôte :
// navigation, métriques et liste des agents. La vue courante n'est qu'un
// texte, l'affichage se limite au terminal.

use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use network::{Agent, HostBindings, SessionState};
use serde_json::{Value, json};
use tracing::info;

const VIEWS: &[&str] = &["dashboard", "agents", "analytics", "settings"];

pub struct DemoDashboard {
    agents: Vec<Agent>,
    view: Mutex<String>,
    started: Instant,
    last_volume: AtomicU32,
    show_meter: bool,
}

impl DemoDashboard {
    pub fn new(show_meter: bool) -> Self {
        Self {
            agents: demo_agents(),
            view: Mutex::new("dashboard".to_string()),
            started: Instant::now(),
            last_volume: AtomicU32::new(0),
            show_meter,
        }
    }

    pub fn current_view(&self) -> String {
        self.view.lock().map(|view| view.clone()).unwrap_or_default()
    }

    pub fn last_volume(&self) -> f32 {
        f32::from_bits(self.last_volume.load(Ordering::Relaxed))
    }
}

fn demo_agents() -> Vec<Agent> {
    let mut agents = vec![
        Agent::new("Support Triage", "active", 182.0),
        Agent::new("Finance Copilot", "active", 241.5),
        Agent::new("Ops Sentinel", "degraded", 612.0),
        Agent::new("Sales Scout", "idle", 0.0),
    ];

    let tasks = [1284, 377, 9021, 58];
    for (agent, completed) in agents.iter_mut().zip(tasks) {
        agent.extra.insert("tasksCompleted".to_string(), json!(completed));
    }
    agents
}

#[async_trait]
impl HostBindings for DemoDashboard {
    fn navigate(&self, view: &str) {
        let known = VIEWS.contains(&view);
        if let Ok(mut current) = self.view.lock() {
            *current = view.to_string();
        }
        info!(view, known, "Navigation demandée par l'assistant");
        println!("\n🧭 Vue : {}", view);
    }

    async fn snapshot_metrics(&self) -> Value {
        let active: Vec<&Agent> = self.agents.iter().filter(|a| a.status == "active").collect();
        let avg_latency = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|a| a.avg_latency_ms).sum::<f64>() / active.len() as f64
        };

        json!({
            "totalAgents": self.agents.len(),
            "activeAgents": active.len(),
            "avgLatencyMs": (avg_latency * 10.0).round() / 10.0,
            "degradedAgents": self.agents.iter().filter(|a| a.status == "degraded").count(),
            "currentView": self.current_view(),
            "uptimeSecs": self.started.elapsed().as_secs(),
        })
    }

    fn lookup_agents(&self) -> Vec<Agent> {
        self.agents.clone()
    }

    fn on_volume(&self, sample: f32) {
        self.last_volume.store(sample.to_bits(), Ordering::Relaxed);
        if self.show_meter {
            print!("\r🎤 {}", volume_bar(sample, 30));
            let _ = io::stdout().flush();
        }
    }

    fn on_status(&self, state: &SessionState) {
        println!("\n📡 {}", state.description());
    }
}

/// Barre de volume pour le terminal
///
/// Le RMS de la voix dépasse rarement 0.3 : l'échelle est amplifiée.
pub fn volume_bar(level: f32, width: usize) -> String {
    let filled = ((level * 3.0).clamp(0.0, 1.0) * width as f32).round() as usize;
    format!("[{}{}]", "#".repeat(filled), " ".repeat(width - filled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::{GET_AGENT_STATUS, GET_DASHBOARD_METRICS, NAVIGATE_APP, ToolRegistry};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let dashboard = DemoDashboard::new(false);
        let metrics = dashboard.snapshot_metrics().await;

        assert_eq!(metrics["totalAgents"], 4);
        assert_eq!(metrics["activeAgents"], 2);
        assert_eq!(metrics["degradedAgents"], 1);
        assert_eq!(metrics["currentView"], "dashboard");
    }

    #[tokio::test]
    async fn test_tools_against_dashboard() {
        let dashboard = Arc::new(DemoDashboard::new(false));
        let registry = ToolRegistry::with_host_bindings(dashboard.clone());

        let result = registry.dispatch(NAVIGATE_APP, json!({ "view": "analytics" })).await;
        assert_eq!(result["success"], true);
        assert_eq!(dashboard.current_view(), "analytics");

        let metrics = registry.dispatch(GET_DASHBOARD_METRICS, json!({})).await;
        assert_eq!(metrics["currentView"], "analytics");

        let status = registry.dispatch(GET_AGENT_STATUS, json!({ "agentName": "sentinel" })).await;
        assert_eq!(status["found"], true);
        assert_eq!(status["agent"]["status"], "degraded");
        assert_eq!(status["agent"]["tasksCompleted"], 9021);
    }

    #[test]
    fn test_volume_tracking() {
        let dashboard = DemoDashboard::new(false);
        dashboard.on_volume(0.125);
        assert_eq!(dashboard.last_volume(), 0.125);
    }

    #[test]
    fn test_volume_bar() {
        assert_eq!(volume_bar(0.0, 4), "[    ]");
        assert_eq!(volume_bar(1.0, 4), "[####]");
        assert_eq!(volume_bar(0.1, 10).matches('#').count(), 3);
    }
}
