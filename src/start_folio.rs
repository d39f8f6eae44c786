//! Startup helpers for the folio proxy.

use std::process::ExitCode;
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::server::{self, AppState, BucketSweeper, TokenBucketLimiter};

/// Install the global tracing subscriber, honouring `RUST_LOG`.
///
/// Call once per process.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

/// Run the proxy (used by the `folio-proxy` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    init_tracing();
    tracing::info!("Starting folio proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = ProxyConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {e}");
        return ExitCode::from(1);
    }
    tracing::info!(
        port = config.port,
        static_dir = ?config.static_dir,
        upstream = ?config.upstream,
        "Configuration loaded"
    );

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(serve_until_ctrl_c(config)) {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Build the state, start the bucket sweeper and serve until Ctrl-C.
///
/// # Errors
/// Returns an error if state creation or the server fails.
pub async fn serve_until_ctrl_c(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let port = config.port;
    let limiter = Arc::new(TokenBucketLimiter::new(config.rate_limit.clone()));
    let state = AppState::new(config, Arc::clone(&limiter) as Arc<dyn server::QuotaChecker>)?;

    let sweeper = BucketSweeper::new(limiter);
    let stop_sweeper = sweeper.shutdown_token();
    let sweeper_handle = sweeper.spawn();

    let result = server::run_server_with_shutdown(state, port, shutdown_signal()).await;

    stop_sweeper.cancel();
    if let Err(e) = sweeper_handle.await {
        tracing::warn!("Sweeper task ended abnormally: {e}");
    }
    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}
