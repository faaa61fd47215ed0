//! Re-encode an upstream token stream as OpenAI chat-completion SSE frames

use axum::response::sse::Event;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use grok_client::TokenStream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::metrics::{self, InFlightGuard, Mode, ServiceMetrics};
use crate::models::ChatCompletionChunk;

/// Identity shared by every chunk of one response.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub id: String,
    pub model: String,
    pub created: u64,
    pub request_id: String,
}

struct Encoder {
    tokens: BoxStream<'static, grok_client::Result<String>>,
    meta: ChunkMeta,
    metrics: ServiceMetrics,
    started: Instant,
    done: bool,
    _in_flight: InFlightGuard,
}

/// Build the SSE event stream for one streaming completion.
///
/// Normal end: one finish chunk, then `[DONE]`. Upstream failure: one error
/// chunk and no `[DONE]`. Cancellation ends the stream without another frame.
pub fn encode(
    tokens: TokenStream,
    meta: ChunkMeta,
    metrics: ServiceMetrics,
    in_flight: InFlightGuard,
    started: Instant,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let encoder = Encoder {
        tokens: tokens.into_stream().boxed(),
        meta,
        metrics,
        started,
        done: false,
        _in_flight: in_flight,
    };

    stream::unfold(encoder, |mut encoder| async move {
        let frames = encoder.step().await?;
        Some((frames, encoder))
    })
    .flat_map(stream::iter)
    .map(Ok)
}

impl Encoder {
    /// Frames for the next upstream item, or `None` once finished.
    async fn step(&mut self) -> Option<Vec<Event>> {
        if self.done {
            return None;
        }

        let meta = &self.meta;
        match self.tokens.next().await {
            Some(Ok(token)) => {
                let chunk = ChatCompletionChunk::token(&meta.id, &meta.model, meta.created, token);
                Some(json_event(&chunk).into_iter().collect())
            }
            None => {
                self.done = true;
                metrics::record_request(200, Mode::Streaming, self.started.elapsed().as_secs_f64());
                let finish = ChatCompletionChunk::finish(&meta.id, &meta.model, meta.created);
                let mut frames: Vec<Event> = json_event(&finish).into_iter().collect();
                frames.push(Event::default().data("[DONE]"));
                Some(frames)
            }
            Some(Err(err)) if err.is_cancelled() => {
                self.done = true;
                info!(request_id = %meta.request_id, "stream cancelled");
                None
            }
            Some(Err(err)) => {
                self.done = true;
                warn!(
                    request_id = %meta.request_id,
                    error_type = err.kind(),
                    error = %err,
                    "upstream stream failed"
                );
                metrics::record_upstream_error(err.kind());
                metrics::record_request(500, Mode::Streaming, self.started.elapsed().as_secs_f64());
                self.metrics.record_error();
                let body = ApiError::Upstream {
                    request_id: meta.request_id.clone(),
                }
                .body();
                Some(json_event(&body).into_iter().collect())
            }
        }
    }
}

fn json_event<T: Serialize>(value: &T) -> Option<Event> {
    match Event::default().json_data(value) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "failed to encode SSE frame");
            None
        }
    }
}
