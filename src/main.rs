//! Inkpost - Blog platform identity service
//! Mission: Registration, activation and session tokens over HTTP

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inkpost_backend::{
    auth::AuthState,
    config::{load_env, AuthConfig},
    server::{build_router, build_sessions, spawn_purge_task},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "inkpost")]
#[command(about = "Blog platform identity and session service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve {
        /// Port to listen on; overrides PORT
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Delete expired pending registrations and secrets once, then exit
    PurgePending,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(AuthConfig::from_env().context("Invalid configuration")?);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => serve(config, port).await,
        Command::PurgePending => purge_once(config).await,
    }
}

async fn serve(config: Arc<AuthConfig>, port: Option<u16>) -> Result<()> {
    info!("🚀 Inkpost identity service starting");

    let sessions = build_sessions(config.clone())?;
    spawn_purge_task(sessions.clone(), config.pending_purge_interval);

    let app = build_router(AuthState::new(sessions));

    let addr = format!("0.0.0.0:{}", port.unwrap_or(config.port));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

async fn purge_once(config: Arc<AuthConfig>) -> Result<()> {
    let sessions = build_sessions(config)?;
    let stats = sessions
        .purge_expired()
        .await
        .context("Purge failed")?;

    info!(
        "🧹 Purged {} expired registrations, {} expired secrets",
        stats.pending, stats.secrets
    );
    Ok(())
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkpost_backend=debug,inkpost=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
