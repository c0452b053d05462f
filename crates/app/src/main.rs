// Client vocal pour le tableau de bord des agents
//
// Cette application relie une session vocale temps réel (micro, haut-parleurs,
// WebSocket) à un tableau de bord de démonstration :
// - `run` : ouvre une session et converse jusqu'à Ctrl+C
// - `devices` : affiche les périphériques audio par défaut

mod dashboard;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use audio::CpalDevices;
use network::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, SessionConfig, SessionStats, VoiceSession,
    WebSocketConnector, utils,
};

use crate::dashboard::DemoDashboard;

const DEFAULT_INSTRUCTION: &str = "Tu es l'assistant vocal du tableau de bord des agents. \
Réponds brièvement. Utilise les outils pour lire les métriques, consulter l'état d'un agent \
ou changer de vue.";

#[derive(Parser)]
#[command(author, version, about = "Session vocale temps réel avec le tableau de bord")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ouvre une session vocale
    Run {
        /// URL WebSocket du service
        #[arg(long, env = "VOICE_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Clé d'API du service
        #[arg(long, env = "VOICE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,

        /// Voix de synthèse (par exemple Puck)
        #[arg(long)]
        voice: Option<String>,

        /// Consigne système envoyée au démarrage
        #[arg(long)]
        instruction: Option<String>,

        /// Affiche le niveau du micro
        #[arg(short, long)]
        meter: bool,
    },
    /// Affiche les périphériques audio par défaut
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { endpoint, api_key, model, voice, instruction, meter } => {
            let config = SessionConfig {
                endpoint,
                api_key,
                model,
                voice,
                system_instruction: Some(
                    instruction.unwrap_or_else(|| DEFAULT_INSTRUCTION.to_string()),
                ),
                ..Default::default()
            };
            run_session(config, meter).await
        }
        Commands::Devices => list_devices(),
    }
}

/// Ouvre la session et attend Ctrl+C ou la fin de la session
async fn run_session(config: SessionConfig, meter: bool) -> Result<()> {
    config.validate().map_err(anyhow::Error::msg)?;

    println!("🚀 Session vocale (network v{})", network::VERSION);
    println!("📡 Connexion à {}...", utils::redact_key(&config.endpoint_url()));

    let dashboard = Arc::new(DemoDashboard::new(meter));
    let session = VoiceSession::with_host_tools(
        config,
        Arc::new(CpalDevices::new()),
        Arc::new(WebSocketConnector::new()),
        dashboard,
    );

    let started = Instant::now();
    session.connect().await.context("Ouverture de la session impossible")?;
    println!("🎙️  Session {} active, parlez ! (Ctrl+C pour quitter)", session.session_id());

    let mut status = session.subscribe();
    tokio::select! {
        _ = signal::ctrl_c() => println!("\n🛑 Arrêt demandé"),
        _ = status.wait_for(|state| state.is_terminal()) => {}
    }

    session.disconnect().await;
    print_stats(&session.stats(), started);

    match session.state().failure() {
        Some(failure) => anyhow::bail!("Session terminée en erreur : {} ({})", failure, failure.message),
        None => {
            println!("👋 Session terminée");
            Ok(())
        }
    }
}

fn print_stats(stats: &SessionStats, started: Instant) {
    println!("\n📊 Statistiques ({})", utils::format_duration(started.elapsed()));
    println!("   Frames envoyées : {}", stats.frames_sent);
    println!("   Audio reçu : {} morceaux ({} programmés)", stats.audio_chunks_received, stats.audio_chunks_scheduled);
    println!("   Appels d'outils : {} ({} lots de réponses)", stats.tool_calls_handled, stats.tool_responses_sent);
    println!("   Interruptions : {}", stats.interruptions);
    if stats.contained_errors() > 0 {
        println!(
            "   ⚠️  Messages ignorés : {} (protocole {}, audio {})",
            stats.contained_errors(),
            stats.protocol_errors,
            stats.codec_errors
        );
    }
}

fn list_devices() -> Result<()> {
    println!("🔊 Périphériques audio");
    for line in CpalDevices::new().describe()? {
        println!("   {}", line);
    }
    Ok(())
}
