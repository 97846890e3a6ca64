//! LabGen Studio gateway
//!
//! Single-binary service that:
//! 1. Loads the key pool from configuration and the environment
//! 2. Serves the studio generation API on the public listener
//! 3. Fails over across pool keys when a key's quota runs out
//! 4. Serves key pool administration on a separate local listener

mod admin;
mod api;
mod config;
mod error;
mod facade;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use gemini_client::GeminiClientFactory;
use key_pool::{KeyPool, RetryingInvoker};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::api::{AppState, build_router};
use crate::config::Config;
use crate::facade::Studio;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting labgen-studio-gateway");

    // Before any metric is emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let config_path = Config::resolve_path(cli_config_path);

    let config = if cli_config_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "no configuration file, using defaults");
        Config::parse("").context("invalid default configuration")?
    } else {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    };

    let records = config.pool.records().context("failed to resolve pool keys")?;
    let configured = records.iter().filter(|r| r.is_configured()).count();
    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        base_url = %config.gemini.base_url,
        keys_total = records.len(),
        keys_configured = configured,
        max_retries = config.pool.max_retries,
        "configuration loaded"
    );
    if configured == 0 {
        warn!("no pool key has a secret; only personal keys will work");
    }

    let http = reqwest::Client::builder()
        .timeout(config.gemini.timeout())
        .build()
        .context("failed to build HTTP client")?;
    let factory = GeminiClientFactory::with_base_url(http, &config.gemini.base_url);
    let pool = Arc::new(KeyPool::new(records));
    let invoker = RetryingInvoker::new(pool, factory, config.pool.max_retries);
    let studio = Arc::new(Studio::new(invoker, config.video.poll_settings()));

    let events = spawn_failover_logger(&studio);

    let app = build_router(
        AppState {
            studio: studio.clone(),
            prometheus: prometheus_handle,
            started_at: Instant::now(),
        },
        config.server.max_connections,
        config.server.max_body_bytes,
    );
    let admin_app = build_admin_router(AdminState::new(studio));

    let (public_tx, public_server) = serve(config.server.listen_addr, app).await?;
    info!(addr = %config.server.listen_addr, "accepting requests");
    let (admin_tx, admin_server) = serve(config.server.admin_listen_addr, admin_app).await?;
    info!(addr = %config.server.admin_listen_addr, "admin API listening");

    shutdown_signal().await;

    // Drain timeout starts at signal receipt
    let _ = public_tx.send(());
    let _ = admin_tx.send(());
    let drained = async {
        let (public, admin) = tokio::join!(public_server, admin_server);
        [("public", public), ("admin", admin)]
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drained).await {
        Ok(results) => {
            for (listener, result) in results {
                match result {
                    Ok(Ok(())) => info!(listener, "listener drained"),
                    Ok(Err(e)) => error!(listener, error = %e, "server error during shutdown"),
                    Err(e) => error!(listener, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    events.abort();
    info!("shutdown complete");
    Ok(())
}

type ServerTask = JoinHandle<std::io::Result<()>>;

/// Bind `addr` and serve `app` until the returned sender fires.
async fn serve(addr: SocketAddr, app: Router) -> Result<(oneshot::Sender<()>, ServerTask)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
    });
    Ok((tx, task))
}

/// Log every failover so operators can see keys dropping out of rotation.
fn spawn_failover_logger(studio: &Studio) -> JoinHandle<()> {
    let mut rx = studio.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(
                    workload = %event.workload,
                    abandoned = %event.abandoned_label,
                    attempt = event.attempt,
                    "key failover"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "failover log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
