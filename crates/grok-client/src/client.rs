//! Upstream exchange and token production
//!
//! Each call spawns one producer task that owns the HTTP exchange, the line
//! decoder and the sending half of the token channel. The channel holds a
//! single token, so a slow consumer stalls upstream reads instead of growing
//! a buffer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use grok_pool::Rotator;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::decoder::{LineDecoder, decode_line};
use crate::error::{Error, PartialFailure, Result};
use crate::request::{DEFAULT_TIMEOUT, DEFAULT_UPSTREAM_URL, UpstreamRequest, build_headers};
use crate::state::{CallEvent, CallState, transition};
use crate::stream::{ErrorSlot, TokenStream};

/// Bytes of a non-success response body read for diagnostics.
const MAX_ERROR_BODY_BYTES: usize = 8 * 1024;

/// Bytes of a skipped line included in debug logs.
const SKIPPED_LINE_PREVIEW: usize = 200;

/// Upstream endpoint settings, fixed for the client's lifetime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub upstream_url: String,
    /// Ceiling for one whole exchange, response body included
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Translator client. Cheap to clone; clones share the rotator.
#[derive(Clone)]
pub struct GrokClient {
    http: reqwest::Client,
    rotator: Arc<Rotator>,
    config: ClientConfig,
}

impl GrokClient {
    pub fn new(http: reqwest::Client, rotator: Arc<Rotator>, config: ClientConfig) -> Self {
        Self {
            http,
            rotator,
            config,
        }
    }

    pub fn rotator(&self) -> &Arc<Rotator> {
        &self.rotator
    }

    /// Start an upstream call and return its live token sequence immediately.
    ///
    /// The call is cancelled when `cancel` fires or when the returned stream
    /// is dropped.
    pub fn stream(
        &self,
        conversation: impl Into<String>,
        model: impl Into<String>,
        cancel: &CancellationToken,
    ) -> TokenStream {
        let (token_tx, token_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = oneshot::channel();
        let call_cancel = cancel.child_token();

        let model = model.into();
        let span = info_span!(
            "upstream_call",
            call_id = %uuid::Uuid::new_v4().as_simple(),
            model = %model,
        );
        let producer = Producer {
            client: self.clone(),
            tokens: token_tx,
            slot: ErrorSlot::new(error_tx),
            cancel: call_cancel.clone(),
            state: CallState::Idle,
        };
        tokio::spawn(producer.run(conversation.into(), model).instrument(span));

        TokenStream::new(token_rx, error_rx, call_cancel)
    }

    /// Run a call to completion and return the concatenated tokens.
    ///
    /// On failure the tokens received so far are kept in
    /// [`PartialFailure::partial`].
    pub async fn execute(
        &self,
        conversation: impl Into<String>,
        model: impl Into<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, PartialFailure> {
        let mut tokens = self.stream(conversation, model, cancel);
        let mut text = String::new();

        while let Some(item) = tokens.next_token().await {
            match item {
                Ok(token) => text.push_str(&token),
                Err(error) => {
                    return Err(PartialFailure {
                        partial: text,
                        error,
                    });
                }
            }
        }
        Ok(text)
    }
}

/// Producer half of one call.
struct Producer {
    client: GrokClient,
    tokens: mpsc::Sender<String>,
    slot: ErrorSlot,
    cancel: CancellationToken,
    state: CallState,
}

impl Producer {
    async fn run(mut self, conversation: String, model: String) {
        let cancel = self.cancel.clone();

        // Cancellation drops the exchange future, which closes the upstream
        // connection wherever it was suspended.
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.exchange(&conversation, &model) => result,
        };

        match outcome {
            Ok(()) => {
                self.advance(CallEvent::BodyEnded);
                debug!(state = ?self.state, "upstream stream completed");
            }
            Err(error) => {
                let event = if error.is_cancelled() {
                    CallEvent::Cancelled
                } else {
                    CallEvent::Failed
                };
                self.advance(event);
                if error.is_cancelled() {
                    debug!(state = self.state.label(), "upstream call cancelled");
                } else {
                    warn!(state = self.state.label(), error = %error, "upstream call failed");
                }
                self.slot.fail(error);
            }
        }
    }

    async fn exchange(&mut self, conversation: &str, model: &str) -> Result<()> {
        let body = UpstreamRequest {
            message: conversation,
            model_name: model,
        }
        .to_body()?;

        let cookie = self.client.rotator.next_credential();
        let user_agent = self.client.rotator.random_identity();
        self.advance(CallEvent::CredentialIssued);

        let headers = build_headers(&cookie, &user_agent)?;
        let timeout = self.client.config.timeout;

        self.advance(CallEvent::RequestDispatched);
        let response = self
            .client
            .http
            .post(&self.client.config.upstream_url)
            .headers(headers)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(timeout)
                } else {
                    Error::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            self.advance(CallEvent::Rejected {
                status: status.as_u16(),
            });
            let body = drain_error_body(response).await;
            // No retry and no extra rotation: the cursor already moved past
            // this cookie, so the next call uses the next one.
            warn!(
                status = status.as_u16(),
                pool_size = self.client.rotator.pool_size(),
                next_cursor = self.client.rotator.current_cursor(),
                body = %body,
                "upstream rejected request"
            );
            return Err(Error::Status {
                status: status.as_u16(),
            });
        }
        self.advance(CallEvent::Accepted);

        let mut body = response.bytes_stream();
        let mut decoder = LineDecoder::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(timeout)
                } else {
                    Error::Stream(e.to_string())
                }
            })?;
            let lines = decoder
                .push(&chunk)
                .map_err(|e| Error::Stream(e.to_string()))?;
            for line in lines {
                self.emit(&line).await?;
            }
        }
        if let Some(line) = decoder.finish() {
            self.emit(&line).await?;
        }

        Ok(())
    }

    /// Decode one line and hand its token to the consumer, waiting for room.
    async fn emit(&mut self, line: &[u8]) -> Result<()> {
        match decode_line(line) {
            Ok(Some(token)) => {
                // Send fails only when the consumer dropped the stream
                self.tokens
                    .send(token)
                    .await
                    .map_err(|_| Error::Cancelled)?;
                self.advance(CallEvent::TokenDelivered);
                metrics::counter!("upstream_tokens_total").increment(1);
            }
            Ok(None) => {}
            Err(skip) => {
                let preview = &line[..line.len().min(SKIPPED_LINE_PREVIEW)];
                debug!(
                    reason = %skip,
                    line = %String::from_utf8_lossy(preview),
                    "skipping upstream line"
                );
                metrics::counter!("upstream_lines_skipped_total", "reason" => skip.label())
                    .increment(1);
            }
        }
        Ok(())
    }

    fn advance(&mut self, event: CallEvent) {
        let previous = std::mem::replace(&mut self.state, CallState::Idle);
        self.state = transition(previous, event);
    }
}

/// Read at most [`MAX_ERROR_BODY_BYTES`] of a rejected response for logging.
async fn drain_error_body(response: reqwest::Response) -> String {
    let mut body = response.bytes_stream();
    let mut collected = Vec::new();

    while let Some(Ok(chunk)) = body.next().await {
        let room = MAX_ERROR_BODY_BYTES - collected.len();
        collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if collected.len() >= MAX_ERROR_BODY_BYTES {
            break;
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}
