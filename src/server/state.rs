//! Application state shared across all request handlers.

use std::sync::Arc;

use crate::config::ProxyConfig;

use super::error::ProxyError;
use super::ratelimit::{QuotaChecker, QuotaDecision};
use super::upstream::UpstreamClient;

/// Shared application state.
pub struct AppState {
    /// Proxy configuration.
    pub config: ProxyConfig,
    /// Upstream agent client.
    pub upstream: UpstreamClient,
    /// Per-client quota.
    pub quota: Arc<dyn QuotaChecker>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Errors
    /// Returns an error if the upstream HTTP client cannot be created.
    pub fn new(config: ProxyConfig, quota: Arc<dyn QuotaChecker>) -> Result<Arc<Self>, reqwest::Error> {
        let upstream = UpstreamClient::new(config.upstream.clone())?;
        Ok(Arc::new(Self {
            config,
            upstream,
            quota,
        }))
    }

    /// Spend one unit of `client`'s quota, failing once it is exhausted.
    pub fn check_quota(&self, client: &str) -> Result<QuotaDecision, ProxyError> {
        let decision = self.quota.consume(client);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ProxyError::QuotaExceeded(decision))
        }
    }
}
