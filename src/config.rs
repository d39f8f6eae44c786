//! Configuration for the proxy server and the chat client.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Environment variable for the upstream "new session" endpoint.
pub const ENV_SESSION_ENDPOINT: &str = "AGENT_API_ENDPOINT";
/// Environment variable for the upstream "send message" endpoint.
pub const ENV_INTERACTION_ENDPOINT: &str = "AGENT_API_ENDPOINT_INTERACTION";
/// Environment variable for the upstream bearer token.
pub const ENV_BEARER_TOKEN: &str = "BEARER_TOKEN";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// An endpoint is not a valid URL.
    #[error("invalid url for {field}: {source}")]
    Url {
        /// Offending field.
        field: &'static str,
        /// Parse failure.
        source: url::ParseError,
    },
}

/// Top-level proxy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listening port.
    pub port: u16,
    /// Directory of static site assets served as the fallback route.
    pub static_dir: Option<PathBuf>,
    /// Upstream agent settings.
    pub upstream: UpstreamConfig,
    /// Per-client quota.
    pub rate_limit: RateLimitConfig,
    /// Longest accepted chat message, in characters.
    pub max_message_chars: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            static_dir: None,
            upstream: UpstreamConfig::default(),
            rate_limit: RateLimitConfig::default(),
            max_message_chars: 1000,
        }
    }
}

impl ProxyConfig {
    /// Build the configuration from the process environment, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            port: parse_var(&lookup, "FOLIO_PORT").unwrap_or(defaults.port),
            static_dir: lookup("FOLIO_STATIC_DIR").filter(|v| !v.is_empty()).map(PathBuf::from),
            upstream: UpstreamConfig {
                session_endpoint: lookup(ENV_SESSION_ENDPOINT).unwrap_or_default(),
                interaction_endpoint: lookup(ENV_INTERACTION_ENDPOINT).unwrap_or_default(),
                bearer_token: lookup(ENV_BEARER_TOKEN).unwrap_or_default(),
                app_name: lookup("FOLIO_APP_NAME").unwrap_or(defaults.upstream.app_name),
                user_id: lookup("FOLIO_USER_ID").unwrap_or(defaults.upstream.user_id),
                connect_timeout: parse_var(&lookup, "FOLIO_UPSTREAM_CONNECT_TIMEOUT_SECS")
                    .map_or(defaults.upstream.connect_timeout, Duration::from_secs),
            },
            rate_limit: RateLimitConfig {
                capacity: parse_var(&lookup, "FOLIO_RATE_LIMIT_CAPACITY").unwrap_or(defaults.rate_limit.capacity),
                refill: parse_var(&lookup, "FOLIO_RATE_LIMIT_REFILL").unwrap_or(defaults.rate_limit.refill),
                interval: parse_var(&lookup, "FOLIO_RATE_LIMIT_INTERVAL_SECS")
                    .map_or(defaults.rate_limit.interval, Duration::from_secs),
                sweep_interval: parse_var(&lookup, "FOLIO_RATE_LIMIT_SWEEP_SECS")
                    .map_or(defaults.rate_limit.sweep_interval, Duration::from_secs),
            },
            max_message_chars: parse_var(&lookup, "FOLIO_MAX_MESSAGE_CHARS").unwrap_or(defaults.max_message_chars),
        }
    }

    /// Validate configuration invariants.
    ///
    /// Missing upstream credentials are allowed here; they fail requests instead.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_chars == 0 {
            return Err(ConfigError::Invalid("max_message_chars must be > 0".to_string()));
        }
        self.rate_limit.validate()?;
        self.upstream.validate()
    }
}

/// Upstream agent endpoints and credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Endpoint that mints a new session.
    pub session_endpoint: String,
    /// Endpoint that accepts a message and streams the reply.
    pub interaction_endpoint: String,
    /// Static bearer credential.
    pub bearer_token: String,
    /// Application name sent with every message.
    pub app_name: String,
    /// User id sent with every message.
    pub user_id: String,
    /// TCP connect timeout for upstream calls.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            session_endpoint: String::new(),
            interaction_endpoint: String::new(),
            bearer_token: String::new(),
            app_name: "rag-agent-app".to_string(),
            user_id: "user".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("session_endpoint", &self.session_endpoint)
            .field("interaction_endpoint", &self.interaction_endpoint)
            .field("bearer_token", &if self.bearer_token.is_empty() { "<unset>" } else { "<redacted>" })
            .field("app_name", &self.app_name)
            .field("user_id", &self.user_id)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl UpstreamConfig {
    /// Endpoints that are set must be valid URLs.
    ///
    /// # Errors
    /// Returns an error naming the first unparsable endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("session_endpoint", &self.session_endpoint),
            ("interaction_endpoint", &self.interaction_endpoint),
        ] {
            if !value.is_empty() {
                Url::parse(value).map_err(|source| ConfigError::Url { field, source })?;
            }
        }
        Ok(())
    }
}

/// Token-bucket quota applied per client IP.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket size.
    pub capacity: u32,
    /// Tokens added every `interval`.
    pub refill: u32,
    /// Refill period.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// How often idle buckets are swept.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill: 20,
            interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    /// Validate quota invariants.
    ///
    /// # Errors
    /// Returns an error if any value is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("rate_limit.capacity must be > 0".to_string()));
        }
        if self.refill == 0 {
            return Err(ConfigError::Invalid("rate_limit.refill must be > 0".to_string()));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid("rate_limit.interval must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Chat client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the proxy, e.g. `http://127.0.0.1:3000`.
    pub proxy_url: String,
    /// `SQLite` file holding the session; in-memory when unset.
    pub session_store: Option<PathBuf>,
    /// How often to poll for session changes made by other processes.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
            session_store: None,
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    /// Validate the proxy URL.
    ///
    /// # Errors
    /// Returns an error if the proxy URL is not a valid URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.proxy_url).map_err(|source| ConfigError::Url {
            field: "proxy_url",
            source,
        })?;
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|v| v.trim().parse().ok())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
