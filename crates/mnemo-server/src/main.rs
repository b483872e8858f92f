//! Mnemo Server - memory service for conversational agents
//!
//! Ingests chat messages, distills them into typed memory records through
//! LLM-guided episode boundary detection, and serves keyword / vector /
//! hybrid retrieval over the result. One binary, one SQLite file, remote
//! embedding / rerank / LLM providers with automatic failover.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mnemo_core::{MemoryConfig, MemoryEngine};
use mnemo_server::{router, AppState};

/// Command-line options
#[derive(Debug, Parser)]
#[command(name = "mnemo-server", version, about = "Memory service for conversational agents")]
struct Cli {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 8900)]
    port: u16,

    /// Configuration file (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file override
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Load configuration from the optional TOML file, then apply environment
/// overrides for provider secrets.
fn load_config(cli: &Cli) -> anyhow::Result<MemoryConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => MemoryConfig::default(),
    };

    if let Some(db_path) = &cli.db_path {
        config.db_path = Some(db_path.clone());
    }
    for (var, slot) in [
        ("MNEMO_EMBEDDING_API_KEY", &mut config.embedding.primary_api_key),
        ("MNEMO_EMBEDDING_FALLBACK_API_KEY", &mut config.embedding.fallback_api_key),
        ("MNEMO_RERANK_API_KEY", &mut config.rerank.primary_api_key),
        ("MNEMO_RERANK_FALLBACK_API_KEY", &mut config.rerank.fallback_api_key),
        ("MNEMO_LLM_API_KEY", &mut config.llm.api_key),
    ] {
        if let Ok(value) = std::env::var(var) {
            *slot = value;
        }
    }
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = load_config(&cli)?;
    info!(
        "Starting mnemo-server v{} (db: {:?})",
        mnemo_core::VERSION,
        config.db_path
    );

    let engine = MemoryEngine::from_config(&config).context("assembling the memory engine")?;
    let app = router(AppState::new(engine));

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("parsing bind address")?;
    info!("Memory service listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Memory service shutting down");
    Ok(())
}
