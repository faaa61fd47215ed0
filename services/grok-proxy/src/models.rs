//! OpenAI-compatible wire types and the advertised model catalog

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Models advertised on `/v1/models`.
const CATALOG: &[&str] = &["grok-latest", "grok-3"];

/// Inbound `POST /v1/chat/completions` body.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    /// Accepted for compatibility; the upstream has no equivalent.
    #[serde(default)]
    #[allow(dead_code)]
    pub max_tokens: Option<u32>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content: plain string or an array of typed parts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Text of the message; non-text parts are dropped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Flatten a conversation into the single string the upstream accepts.
///
/// One `role: content` block per message, blank line between messages.
pub fn render_conversation(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let content = m.content.as_ref().map(MessageContent::text).unwrap_or_default();
            format!("{}: {}", m.role, content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Non-streaming response
#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatCompletion {
    pub fn new(id: String, model: String, content: String) -> Self {
        Self {
            id,
            object: "chat.completion",
            created: unix_now(),
            model,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        }
    }
}

/// One SSE chunk of a streaming response
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

/// Incremental content; serializes as `{}` when empty.
#[derive(Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    /// Chunk carrying one token.
    pub fn token(id: &str, model: &str, created: u64, token: String) -> Self {
        Self::build(
            id,
            model,
            created,
            Delta {
                content: Some(token),
            },
            None,
        )
    }

    /// Final chunk with an empty delta and `finish_reason: "stop"`.
    pub fn finish(id: &str, model: &str, created: u64) -> Self {
        Self::build(id, model, created, Delta::default(), Some("stop"))
    }

    fn build(
        id: &str,
        model: &str,
        created: u64,
        delta: Delta,
        finish_reason: Option<&'static str>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

/// `/v1/models` response
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<Model>,
}

#[derive(Debug, Serialize)]
pub struct Model {
    pub id: &'static str,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

pub fn model_catalog() -> ModelList {
    let created = unix_now();
    ModelList {
        object: "list",
        data: CATALOG
            .iter()
            .map(|id| Model {
                id,
                object: "model",
                created,
                owned_by: "xai",
            })
            .collect(),
    }
}

/// `chatcmpl-<uuid>` response id
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().as_simple())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
