//! Client address used as the rate limit key.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;

/// Key used when no address can be determined.
pub const ANONYMOUS: &str = "anonymous";

/// Best-effort client address of the current request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
        Ok(Self(resolve_client_ip(&parts.headers, peer)))
    }
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
#[must_use]
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 4000)));
        assert_eq!(resolve_client_ip(&headers, peer), "203.0.113.7");
    }

    #[test]
    fn test_fallback_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(resolve_client_ip(&headers, None), "198.51.100.2");

        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 4000)));
        assert_eq!(resolve_client_ip(&HeaderMap::new(), peer), "127.0.0.1");
        assert_eq!(resolve_client_ip(&HeaderMap::new(), None), ANONYMOUS);
    }
}
