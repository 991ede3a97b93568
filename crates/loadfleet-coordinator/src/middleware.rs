use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Shared-secret bearer auth for the control API and broker.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Key callers must present. Empty = no auth required.
    pub api_key: String,
}

impl AuthConfig {
    /// Require `api_key` on every protected route.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Returns true if authentication is enabled (a key is configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn accepts(&self, key: &str) -> bool {
        constant_time_eq(key.as_bytes(), self.api_key.as_bytes())
    }
}

/// Auth middleware: validates `Authorization: Bearer <key>`.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match key {
        Some(k) if auth.accepts(k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            (StatusCode::UNAUTHORIZED, "API key required").into_response()
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_config_disabled() {
        let config = AuthConfig::new("");
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_auth_config_accepts_only_its_key() {
        let config = AuthConfig::new("key123");
        assert!(config.is_enabled());
        assert!(config.accepts("key123"));
        assert!(!config.accepts("key124"));
        assert!(!config.accepts("key12"));
    }
}
