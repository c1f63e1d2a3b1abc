//! RPC transport over HTTP

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tracing::{error, info};

use crate::handlers::{self, AppState};

/// Create and configure the Axum router
///
/// Seal and validate calls share one pool of `max_workers` slots; further
/// calls wait for a slot. `/health` is outside the pool.
pub fn create_router(service: AppState, max_workers: usize) -> Router {
    let api: Router<AppState> = Router::new()
        .route("/api/v1/seal", post(handlers::seal))
        .route("/api/v1/validate", post(handlers::validate))
        .route_layer(GlobalConcurrencyLimitLayer::new(max_workers.max(1)));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .with_state(service)
}

/// Serve until `shutdown` resolves, letting in-flight requests finish.
pub async fn run(
    listener: tokio::net::TcpListener,
    service: AppState,
    max_workers: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = create_router(service, max_workers);

    info!(
        "Eduseal RPC listening on {} with {} workers",
        listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0))),
        max_workers
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Wait for SIGTERM or SIGINT signal
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Starting graceful shutdown...");
}
