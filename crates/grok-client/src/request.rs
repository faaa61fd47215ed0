//! Upstream request construction
//!
//! Wire contract: `POST` with JSON body `{"message": ..., "modelName": ...}`
//! and browser-style headers. The session cookie and user-agent come from the
//! rotator; everything else is fixed.

use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::error::{Error, Result};

/// Conversation endpoint of the upstream service.
pub const DEFAULT_UPSTREAM_URL: &str = "https://grok.com/rest/app-chat/conversations/new";

/// Wall-clock ceiling for one whole exchange, body included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(240);

const UPSTREAM_AUTHORITY: &str = "grok.com";
const UPSTREAM_ORIGIN: &str = "https://grok.com";
const UPSTREAM_REFERER: &str = "https://grok.com/?referrer=website";

/// JSON body sent upstream. The conversation is forwarded as an opaque string.
#[derive(Debug, Serialize)]
pub struct UpstreamRequest<'a> {
    pub message: &'a str,
    #[serde(rename = "modelName")]
    pub model_name: &'a str,
}

impl UpstreamRequest<'_> {
    pub fn to_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::RequestConstruction(e.to_string()))
    }
}

/// Build the fixed protocol headers plus the rotated cookie and user-agent.
///
/// An empty cookie is allowed (empty pool); a cookie or user-agent containing
/// bytes that are invalid in a header value fails the call before any
/// upstream contact.
pub fn build_headers(cookie: &str, user_agent: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("authority"),
        HeaderValue::from_static(UPSTREAM_AUTHORITY),
    );
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::ORIGIN, HeaderValue::from_static(UPSTREAM_ORIGIN));
    headers.insert(header::REFERER, HeaderValue::from_static(UPSTREAM_REFERER));

    let cookie = HeaderValue::from_str(cookie)
        .map_err(|e| Error::RequestConstruction(format!("invalid cookie value: {e}")))?;
    headers.insert(header::COOKIE, cookie);

    let user_agent = HeaderValue::from_str(user_agent)
        .map_err(|e| Error::RequestConstruction(format!("invalid user-agent value: {e}")))?;
    headers.insert(header::USER_AGENT, user_agent);

    Ok(headers)
}
