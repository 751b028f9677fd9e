//! reel server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use reel_core::config::AppConfig;
use reel_server::bootstrap::ensure_admin_token;
use reel_server::sweep::{recover_orphaned_jobs, spawn_scheduler};
use reel_server::{AppState, create_router};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// reel - chunked, resumable upload server
#[derive(Parser, Debug)]
#[command(name = "reeld")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "REEL_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Load configuration from an optional TOML file merged with `REEL_` env vars.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    // REEL_CONFIG only names the file.
    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("REEL_") && key != "REEL_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: reeld --config /path/to/config.toml\n  \
             2. Environment variables: REEL_SERVER__BIND=0.0.0.0:8080 \
             REEL_ADMIN__TOKEN_HASH=sha256:YOUR_TOKEN_HASH_HERE reeld\n\n\
             See config/server.example.toml for example configuration."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("REEL_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    config
        .sweep
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid sweep configuration: {e}"))?;
    config
        .storage
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid storage configuration: {e}"))?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("reel v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    reel_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = reel_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    // Fail fast rather than report healthy with unreachable storage.
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend ready");

    let metadata = reel_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    ensure_admin_token(metadata.as_ref(), &config.admin).await?;

    recover_orphaned_jobs(metadata.as_ref())
        .await
        .context("failed to recover orphaned maintenance jobs")?;

    let state = AppState::new(config.clone(), storage, metadata);

    if config.sweep.auto_schedule_enabled {
        spawn_scheduler(state.clone());
    } else {
        tracing::info!("Automatic sweeps disabled");
    }

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
