//! `cadenced` — the Cadence runtime daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cadence_domain::config::Config;
use cadence_gateway::{api, runtime, state::AppState};

#[derive(Debug, Parser)]
#[command(name = "cadenced", about = "Cadence agentic orchestration runtime")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the bind address from config.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config: Config = if cli.config.exists() {
        let raw = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading {}", cli.config.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", cli.config.display()))?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    let bind = config.server.bind.clone();
    let state = AppState::build(config).context("building app state")?;

    // Initial MCP discovery (best-effort; the TTL cache refreshes later).
    state.refresh_external_tools().await;

    // Scheduler beat loop.
    runtime::scheduler::runner::spawn(state.clone());

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "cadenced listening");
    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}
