//! Listener/pool start-stop and signal handling.

use std::sync::Arc;

use kirogate_server::pool::SessionPool;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::facade::{self, GatewayState};
use crate::router::Router as ChannelRouter;

pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    config.validate()?;

    let router = match &config.routes_path {
        Some(path) => Arc::new(ChannelRouter::load(path)?),
        None => Arc::new(ChannelRouter::empty()),
    };

    let pool = SessionPool::new(config.pool_options());
    let gc_handle = tokio::spawn(pool.clone().run_idle_gc());
    let heartbeat_handle = tokio::spawn(pool.clone().run_heartbeat());

    let state = Arc::new(GatewayState {
        pool: pool.clone(),
        router,
    });
    let app = facade::build_router(state);

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "kirogate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    info!("shutting down: stopping background tasks and agent subprocesses");
    gc_handle.abort();
    heartbeat_handle.abort();
    pool.shutdown().await;

    Ok(())
}

/// Wait for SIGINT, SIGTERM, or SIGHUP.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(error = %error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(unix)]
    let hangup = async {
        match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGHUP handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = hangup => {},
    }
}
