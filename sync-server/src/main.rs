//! rootsync-server binary entry point.
//!
//! Usage:
//! ```bash
//! rootsync-server --config rootsync.toml
//! ```

use anyhow::{Context, Result};
use iroh::protocol::Router;
use iroh::{Endpoint, SecretKey};
use rootsync_server::config::Config;
use rootsync_server::http::{build_router, health};
use rootsync_server::protocol::{SyncProtocol, ALPN};
use rootsync_server::rescan::spawn_rescan_task;
use rootsync_server::server::SyncServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    health::init_start_time();

    let config_path = get_config_path();
    let config = if config_path.exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        tracing::warn!("{} not found, using defaults", config_path.display());
        Config::default()
    };
    config.validate().context("Invalid configuration")?;

    let secret_key = match &config.server.secret_key_path {
        Some(path) => load_or_create_key(path).await?,
        None => generate_key()?,
    };

    let server = Arc::new(
        SyncServer::open(config.clone())
            .await
            .context("Failed to open store")?,
    );

    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .context("Failed to create endpoint")?;
    tracing::info!("rootsync-server v{} listening", env!("CARGO_PKG_VERSION"));
    tracing::info!("EndpointId: {}", endpoint.id());

    let router = Router::builder(endpoint)
        .accept(ALPN, SyncProtocol::new(server.clone()))
        .spawn();

    let listener = tokio::net::TcpListener::bind(&config.http.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.http.bind_address))?;
    tracing::info!("HTTP on {}", config.http.bind_address);
    let app = build_router(server.clone());
    let http = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let rescan = spawn_rescan_task(server);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutting down...");

    rescan.abort();
    http.abort();
    router
        .shutdown()
        .await
        .context("Failed to shutdown router")?;

    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rootsync.toml"))
}

fn generate_key() -> Result<SecretKey> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).context("Failed to generate endpoint key")?;
    Ok(SecretKey::from_bytes(&bytes))
}

/// Read the endpoint key, creating it on first start so the EndpointId is stable.
async fn load_or_create_key(path: &Path) -> Result<SecretKey> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .with_context(|| format!("{} must hold 32 bytes", path.display()))?;
            Ok(SecretKey::from_bytes(&bytes))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = generate_key()?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, key.to_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Generated endpoint key at {}", path.display());
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
