//! HTTP proxy in front of the upstream agent API.
//!
//! Provides endpoints for:
//! - Session creation (`POST /api/session`)
//! - Message relay with a streamed reply (`POST /api/chatbot`)
//! - Health checks and an optional static site fallback
//!
//! Both API endpoints are gated by a per-client token bucket.

pub mod client_ip;
pub mod error;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod upstream;

pub use client_ip::ClientIp;
pub use error::ProxyError;
pub use ratelimit::{BucketSweeper, QuotaChecker, QuotaDecision, TokenBucketLimiter};
pub use routes::create_router;
pub use state::AppState;
pub use upstream::{UpstreamClient, extract_session_id};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Router with CORS and request tracing applied.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    create_router(state).layer(cors).layer(TraceLayer::new_for_http())
}

/// Start the HTTP server.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    run_server_with_shutdown(state, port, std::future::pending()).await
}

/// Start the HTTP server with graceful shutdown support.
///
/// The server will stop accepting new connections when `shutdown_signal` completes.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run_server_with_shutdown<F>(
    state: Arc<AppState>,
    port: u16,
    shutdown_signal: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown_signal).await?;
    Ok(())
}

/// Serve on an already bound listener until `shutdown_signal` completes.
///
/// # Errors
/// Returns an error if accepting connections fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown_signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Folio proxy listening on http://{}", addr);
    }

    let app = build_app(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal)
        .await
}
