//! OpenAI chat-completions wire types: the request body shape accepted at
//! `/v1/chat/completions`, the streaming chunk and blocking completion
//! response shapes, and the `/v1/models`/`/health` payloads.

use kirogate_shared::message::Message;
use serde::{Deserialize, Serialize};

pub const SYNTHETIC_MODEL_ID: &str = "kirogate-agent";

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub user: Option<String>,
    // Accepted and ignored, per the OpenAI subset this surface covers.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl ChatCompletionRequest {
    /// `stream` defaults to `true` when absent.
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    pub fn role(id: &str, created: i64, model: &str) -> Self {
        Self::new(
            id,
            created,
            model,
            Delta {
                role: Some("assistant"),
                content: None,
            },
            None,
        )
    }

    pub fn content(id: &str, created: i64, model: &str, text: String) -> Self {
        Self::new(
            id,
            created,
            model,
            Delta {
                role: None,
                content: Some(text),
            },
            None,
        )
    }

    pub fn stop(id: &str, created: i64, model: &str) -> Self {
        Self::new(id, created, model, Delta::default(), Some("stop"))
    }

    fn new(
        id: &str,
        created: i64,
        model: &str,
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

    /// Render as one `data: <json>\n\n` SSE frame.
    pub fn to_sse_frame(&self) -> String {
        format!(
            "data: {}\n\n",
            serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
        )
    }
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CompletionMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletionResponse {
    pub fn new(id: String, created: i64, model: String, content: String) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            },
        }
    }
}

/// The blocking path's terminal error shape, distinct from the
/// `invalid_request_error`/404 envelopes the facade uses directly.
#[derive(Debug, Serialize)]
pub struct BlockingErrorResponse {
    pub error: BlockingError,
}

#[derive(Debug, Serialize)]
pub struct BlockingError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl BlockingErrorResponse {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            error: BlockingError {
                message: message.into(),
                kind: "timeout",
            },
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            error: BlockingError {
                message: message.into(),
                kind: "server_error",
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

impl ModelsResponse {
    pub fn synthetic(created: i64) -> Self {
        Self {
            object: "list",
            data: vec![ModelEntry {
                id: SYNTHETIC_MODEL_ID.to_string(),
                object: "model",
                created,
                owned_by: "kirogate",
            }],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InvalidRequestError {
    pub error: InvalidRequestErrorBody,
}

#[derive(Debug, Serialize)]
pub struct InvalidRequestErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl InvalidRequestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: InvalidRequestErrorBody {
                message: message.into(),
                kind: "invalid_request_error",
            },
        }
    }
}
