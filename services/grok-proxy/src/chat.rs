//! `/v1` handlers: model catalog and chat completions

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics::{self, Mode};
use crate::models::{
    ChatCompletion, ChatCompletionRequest, ModelList, completion_id, model_catalog,
    render_conversation, unix_now,
};
use crate::sse::{self, ChunkMeta};

pub async fn list_models() -> Json<ModelList> {
    Json(model_catalog())
}

pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let span = info_span!("chat_completion", request_id = %request_id);
    complete(state, payload, request_id).instrument(span).await
}

async fn complete(
    state: AppState,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
    request_id: String,
) -> Response {
    let started = Instant::now();

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection, "rejected request body");
            return ApiError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    if request.messages.is_empty() {
        return ApiError::InvalidRequest("`messages` must contain at least one message".into())
            .into_response();
    }

    let in_flight = state.metrics.begin();
    let conversation = render_conversation(&request.messages);
    info!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "chat completion"
    );

    if request.stream {
        let tokens = state
            .client
            .stream(conversation, request.model.clone(), &state.shutdown);
        let meta = ChunkMeta {
            id: completion_id(),
            model: request.model,
            created: unix_now(),
            request_id,
        };
        let events = sse::encode(tokens, meta, state.metrics.clone(), in_flight, started);
        return Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    let result = state
        .client
        .execute(conversation, request.model.clone(), &state.shutdown)
        .await;
    drop(in_flight);
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(content) => {
            metrics::record_request(200, Mode::Buffered, elapsed);
            let completion = ChatCompletion::new(completion_id(), request.model, content);
            Json(completion).into_response()
        }
        Err(failure) if failure.error.is_cancelled() => {
            info!(partial_len = failure.partial.len(), "completion cancelled");
            metrics::record_request(503, Mode::Buffered, elapsed);
            ApiError::ShuttingDown.into_response()
        }
        Err(failure) => {
            warn!(
                error_type = failure.error.kind(),
                error = %failure.error,
                partial_len = failure.partial.len(),
                "upstream completion failed"
            );
            metrics::record_upstream_error(failure.error.kind());
            metrics::record_request(500, Mode::Buffered, elapsed);
            state.metrics.record_error();
            ApiError::Upstream { request_id }.into_response()
        }
    }
}
