//! Server runner with graceful shutdown.

use gproxy_core::{ProxyError, Result};
use gproxy_entities::Proxy;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::routes::build_router;

/// Bind and serve the proxy API until SIGINT/SIGTERM.
///
/// The caller owns PID-file bookkeeping; this runs the HTTP loop and
/// closes the database pool on the way out.
pub async fn run_server(proxy: Arc<Proxy>, host: &str, port: u16) -> Result<()> {
    let app = build_router(proxy.clone());

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| ProxyError::configuration(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::BackendUnavailable(format!("cannot bind {addr}: {e}")))?;

    tracing::info!(instance = %proxy.config().instance_name, %addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ProxyError::internal(format!("server error: {e}")))?;

    proxy.shutdown().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
