//! Loopback HTTP/JSON bridge for the web UI.
//!
//! Every response is JSON and carries `success: bool`; failures add
//! `error: string`. Handled domain errors stay HTTP 200, malformed input
//! is 400, unknown routes 404. CORS is permissive: the bridge only ever
//! binds loopback and serves the local control UI.

pub mod handlers;

use crate::orchestrator::Orchestrator;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

/// Build the bridge router over a ready orchestrator.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/api/disks", get(handlers::list_disks))
        .route("/api/status", get(handlers::service_status))
        .route("/api/version", get(handlers::version))
        .route("/api/validate", get(handlers::validate))
        .route("/api/test/current", get(handlers::current_test))
        .route("/api/test/start", post(handlers::start_test))
        .route("/api/test/stop-all", post(handlers::stop_all))
        .route("/api/test/stop/:id", post(handlers::stop_test))
        .route("/api/test/:id", get(handlers::test_status))
        .route("/api/background-tests", get(handlers::background_tests))
        .route(
            "/api/background-tests/cleanup",
            post(handlers::cleanup_background),
        )
        .route("/api/setup", post(handlers::setup))
        .fallback(handlers::not_found)
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

/// Serve the bridge until the shutdown future resolves.
pub async fn run_with_shutdown<F>(
    orchestrator: Orchestrator,
    addr: SocketAddr,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("bridge listening on http://{addr}");
    axum::serve(listener, build_router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await
}
