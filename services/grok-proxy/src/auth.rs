//! Bearer API key check for the `/v1` routes

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common::Secret;
use std::sync::Arc;

use crate::error::ApiError;

/// Accepted API keys.
#[derive(Clone)]
pub struct ApiKeys(Arc<Vec<Secret<String>>>);

impl ApiKeys {
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        Self(Arc::new(keys))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate the `Authorization` header.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let value = headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or(ApiError::MissingApiKey)?;
        let value = value.to_str().map_err(|_| ApiError::MalformedApiKey)?;
        let key = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ApiError::MalformedApiKey)?;

        if self.0.iter().any(|accepted| accepted.expose() == key) {
            Ok(())
        } else {
            Err(ApiError::InvalidApiKey)
        }
    }
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys").field("count", &self.0.len()).finish()
    }
}

/// Middleware rejecting requests without an accepted key.
pub async fn require_api_key(
    State(keys): State<ApiKeys>,
    request: Request,
    next: Next,
) -> Response {
    match keys.check(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            tracing::debug!(error = %err, path = %request.uri().path(), "rejected request");
            crate::metrics::record_auth_failure();
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn keys() -> ApiKeys {
        ApiKeys::new(vec![
            Secret::new("sk-one".to_string()),
            Secret::new("sk-two".to_string()),
        ])
    }

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn accepts_configured_keys() {
        assert!(keys().check(&headers("Bearer sk-one")).is_ok());
        assert!(keys().check(&headers("Bearer sk-two")).is_ok());
    }

    #[test]
    fn missing_header() {
        assert!(matches!(
            keys().check(&HeaderMap::new()),
            Err(ApiError::MissingApiKey)
        ));
    }

    #[test]
    fn wrong_scheme_or_empty_key_is_malformed() {
        for auth in ["Basic sk-one", "sk-one", "Bearer ", "Bearer    "] {
            assert!(
                matches!(keys().check(&headers(auth)), Err(ApiError::MalformedApiKey)),
                "{auth:?}"
            );
        }
    }

    #[test]
    fn unknown_key_is_invalid() {
        assert!(matches!(
            keys().check(&headers("Bearer sk-three")),
            Err(ApiError::InvalidApiKey)
        ));
    }

    #[test]
    fn empty_key_set_rejects_everything() {
        let keys = ApiKeys::new(Vec::new());
        assert!(keys.is_empty());
        assert!(matches!(
            keys.check(&headers("Bearer sk-one")),
            Err(ApiError::InvalidApiKey)
        ));
    }

    #[test]
    fn debug_hides_keys() {
        let debug = format!("{:?}", keys());
        assert!(debug.contains("count: 2"));
        assert!(!debug.contains("sk-one"));
    }
}
