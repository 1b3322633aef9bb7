//! The completions handler and its recovery state machine.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures_util::{StreamExt, stream};
use kirogate_server::pool::{Lease, SessionPool};
use kirogate_server::session::PromptError;
use kirogate_shared::message::{Message, Role};
use kirogate_shared::resolve_key;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::facade::GatewayState;
use crate::router::Router as ChannelRouter;
use crate::wire::{
    BlockingErrorResponse, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    DONE_FRAME, InvalidRequestError, SYNTHETIC_MODEL_ID,
};

const CONSECUTIVE_ERROR_LIMIT: u32 = 3;
const LARGE_PAYLOAD_WARN_CHARS: usize = 500_000;
const LARGE_PAYLOAD_INFO_CHARS: usize = 200_000;

const TIMEOUT_MESSAGE: &str = "⚠️ The session went silent for too long (no tool activity). It has been reset — please resend your message.";
const MULTI_ERROR_MESSAGE: &str = "⚠️ Multiple consecutive errors detected. The session has been reset — please resend your message.";
const CORRUPTION_MESSAGE: &str = "⚠️ Session history became corrupted and auto-recovery failed. Please send /new to reset this conversation.";

/// One piece of a turn's progress: either a chunk of assistant text (which
/// may be ordinary model output or one of the fixed in-band warning/error
/// strings) or the terminal outcome.
enum TurnEvent {
    Content(String),
    Final(FinalOutcome),
}

#[derive(Debug, Clone, Copy)]
enum FinalOutcome {
    Success,
    TimeoutReset,
    ConsecutiveErrorsReset,
    InvalidHistoryFailed,
    OtherFailure,
}

pub async fn handle_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => return invalid_request(format!("invalid JSON body: {error}")),
    };
    if request.messages.is_empty() {
        return invalid_request("messages must be a non-empty array".to_string());
    }

    let key = resolve_session_key(&headers, &request);
    log_payload_size(&request.messages, &key);

    let session_override = state.router.resolve(&key);
    let lease = match state
        .pool
        .get_or_create(&key, &request.messages, session_override)
        .await
    {
        Ok(lease) => lease,
        Err(error) => return service_unavailable(error.to_string()),
    };

    let wants_stream = request.wants_stream();
    let model = request
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| SYNTHETIC_MODEL_ID.to_string());
    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp();

    if lease.delta_text.trim().is_empty() {
        drop(lease);
        return empty_completion(wants_stream, id, created, model);
    }

    let (tx, rx) = mpsc::unbounded_channel::<TurnEvent>();
    let pool = state.pool.clone();
    let router = state.router.clone();
    let messages = request.messages;
    tokio::spawn(run_turn(pool, router, key, messages, lease, tx));

    if wants_stream {
        stream_response(rx, id, created, model)
    } else {
        blocking_response(rx, id, created, model).await
    }
}

/// Precedence: explicit header, then the opaque channel header, then the
/// body `user` field, then the fingerprint. A present-but-blank value at
/// one level is treated as absent so the next-most-specific signal wins.
fn resolve_session_key(headers: &HeaderMap, request: &ChatCompletionRequest) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let explicit = header_value("x-kiro-session-id")
        .or_else(|| header_value("x-openclaw-session-key"))
        .or_else(|| {
            request
                .user
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
        });
    resolve_key(&request.messages, explicit)
}

/// Pre-flight size logging. The payload is never truncated.
fn log_payload_size(messages: &[Message], key: &str) {
    let total_chars: usize = messages.iter().map(|m| m.text().chars().count()).sum();
    if total_chars > LARGE_PAYLOAD_WARN_CHARS {
        warn!(key, total_chars, "very large conversation payload");
    } else if total_chars > LARGE_PAYLOAD_INFO_CHARS {
        info!(key, total_chars, "large conversation payload");
    }
}

/// Drive one turn to completion, emitting content chunks and a terminal
/// outcome through `tx`. Runs as its own task so the streaming response
/// can forward chunks as they arrive.
async fn run_turn(
    pool: Arc<SessionPool>,
    router: Arc<ChannelRouter>,
    key: String,
    messages: Vec<Message>,
    lease: Lease,
    tx: mpsc::UnboundedSender<TurnEvent>,
) {
    let session = lease.session.clone();
    let delta_text = lease.delta_text.clone();
    let sender = tx.clone();
    let result = session
        .prompt(&delta_text, move |chunk| {
            let _ = sender.send(TurnEvent::Content(chunk));
        })
        .await;

    match result {
        Ok(_stop_reason) => {
            pool.record_prompt_outcome(&key, true).await;
            if let Some(message) = context_warning(pool.context_pct(&key).await, &pool) {
                let _ = tx.send(TurnEvent::Content(message));
            }
            let reset_pending = pool.context_reset_pending(&key).await;
            drop(lease);
            if reset_pending {
                pool.reset(&key, "context-critical").await;
            }
            let _ = tx.send(TurnEvent::Final(FinalOutcome::Success));
        }
        Err(PromptError::Timeout) => {
            drop(lease);
            pool.reset(&key, "prompt-idle-timeout").await;
            let _ = tx.send(TurnEvent::Content(TIMEOUT_MESSAGE.to_string()));
            let _ = tx.send(TurnEvent::Final(FinalOutcome::TimeoutReset));
        }
        Err(error) => {
            pool.record_prompt_outcome(&key, false).await;
            let errors = pool.consecutive_errors(&key).await;
            if errors >= CONSECUTIVE_ERROR_LIMIT {
                drop(lease);
                pool.reset(&key, &format!("consecutive-errors-{errors}")).await;
                let _ = tx.send(TurnEvent::Content(MULTI_ERROR_MESSAGE.to_string()));
                let _ = tx.send(TurnEvent::Final(FinalOutcome::ConsecutiveErrorsReset));
            } else if error.is_invalid_history() {
                drop(lease);
                pool.reset(&key, "invalid-conversation-history").await;
                recover_from_invalid_history(pool, router, key, messages, tx).await;
            } else {
                drop(lease);
                let _ = tx.send(TurnEvent::Final(FinalOutcome::OtherFailure));
            }
        }
    }
}

/// Invalid-history recovery: one retry with only the latest user message,
/// against a freshly spawned session.
async fn recover_from_invalid_history(
    pool: Arc<SessionPool>,
    router: Arc<ChannelRouter>,
    key: String,
    messages: Vec<Message>,
    tx: mpsc::UnboundedSender<TurnEvent>,
) {
    let recovery_text = messages
        .iter()
        .rev()
        .find(|m| m.is_role(Role::User))
        .map(|m| m.text())
        .unwrap_or_default();
    let recovery_text = recovery_text.trim();
    if recovery_text.is_empty() {
        let _ = tx.send(TurnEvent::Content(CORRUPTION_MESSAGE.to_string()));
        let _ = tx.send(TurnEvent::Final(FinalOutcome::InvalidHistoryFailed));
        return;
    }

    let session_override = router.resolve(&key);
    let new_lease = match pool.get_or_create(&key, &messages, session_override).await {
        Ok(lease) => lease,
        Err(_) => {
            let _ = tx.send(TurnEvent::Content(CORRUPTION_MESSAGE.to_string()));
            let _ = tx.send(TurnEvent::Final(FinalOutcome::InvalidHistoryFailed));
            return;
        }
    };

    let retry_session = new_lease.session.clone();
    let sender = tx.clone();
    let retry_result = retry_session
        .prompt(recovery_text, move |chunk| {
            let _ = sender.send(TurnEvent::Content(chunk));
        })
        .await;
    drop(new_lease);

    match retry_result {
        Ok(_) => {
            pool.record_prompt_outcome(&key, true).await;
            let _ = tx.send(TurnEvent::Final(FinalOutcome::Success));
        }
        Err(_) => {
            pool.record_prompt_outcome(&key, false).await;
            let _ = tx.send(TurnEvent::Content(CORRUPTION_MESSAGE.to_string()));
            let _ = tx.send(TurnEvent::Final(FinalOutcome::InvalidHistoryFailed));
        }
    }
}

/// In-band context warnings. The `(95%)` figure in the critical string is
/// a fixed, human-facing threshold, independent of the pool's actual
/// configured reset percentage.
fn context_warning(pct: Option<f64>, pool: &SessionPool) -> Option<String> {
    let pct = pct?;
    let options = pool.options();
    if pct >= options.context_critical_pct {
        Some(format!(
            "\n\n🚨 Context window at {pct:.0}% — approaching auto-reset threshold (95%). Send /new now to avoid losing your session mid-task."
        ))
    } else if pct >= options.context_warn_pct {
        Some(format!(
            "\n\n⚠️ Context window at {pct:.0}%. Send /new soon to reset before it fills up."
        ))
    } else {
        None
    }
}

fn empty_completion(wants_stream: bool, id: String, created: i64, model: String) -> Response {
    if wants_stream {
        let role = ChatCompletionChunk::role(&id, created, &model).to_sse_frame();
        let stop = ChatCompletionChunk::stop(&id, created, &model).to_sse_frame();
        let body = format!("{role}{stop}{DONE_FRAME}");
        sse_response(Body::from(body))
    } else {
        Json(ChatCompletionResponse::new(id, created, model, String::new())).into_response()
    }
}

fn stream_response(
    rx: mpsc::UnboundedReceiver<TurnEvent>,
    id: String,
    created: i64,
    model: String,
) -> Response {
    let role_frame = ChatCompletionChunk::role(&id, created, &model).to_sse_frame();
    let head = stream::once(async move { Ok::<_, Infallible>(Bytes::from(role_frame)) });

    let tail = UnboundedReceiverStream::new(rx).map(move |event| {
        let frame = match event {
            TurnEvent::Content(text) => ChatCompletionChunk::content(&id, created, &model, text)
                .to_sse_frame(),
            TurnEvent::Final(_) => {
                format!(
                    "{}{}",
                    ChatCompletionChunk::stop(&id, created, &model).to_sse_frame(),
                    DONE_FRAME
                )
            }
        };
        Ok::<_, Infallible>(Bytes::from(frame))
    });

    sse_response(Body::from_stream(head.chain(tail)))
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap_or_else(|error| panic!("building SSE response failed: {error}"))
}

async fn blocking_response(
    mut rx: mpsc::UnboundedReceiver<TurnEvent>,
    id: String,
    created: i64,
    model: String,
) -> Response {
    let mut buffer = String::new();
    let mut outcome = FinalOutcome::OtherFailure;
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Content(text) => buffer.push_str(&text),
            TurnEvent::Final(final_outcome) => {
                outcome = final_outcome;
                break;
            }
        }
    }

    match outcome {
        FinalOutcome::Success => {
            (StatusCode::OK, Json(ChatCompletionResponse::new(id, created, model, buffer)))
                .into_response()
        }
        FinalOutcome::TimeoutReset => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(BlockingErrorResponse::timeout(buffer)),
        )
            .into_response(),
        FinalOutcome::ConsecutiveErrorsReset
        | FinalOutcome::InvalidHistoryFailed
        | FinalOutcome::OtherFailure => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(BlockingErrorResponse::server_error(buffer)),
        )
            .into_response(),
    }
}

fn invalid_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(InvalidRequestError::new(message))).into_response()
}

fn service_unavailable(message: String) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": {"message": message, "type": "service_unavailable"}
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirogate_server::pool::PoolOptions;

    #[test]
    fn context_warning_is_none_below_the_warn_threshold() {
        let pool = SessionPool::new(PoolOptions::default());
        assert!(context_warning(Some(10.0), &pool).is_none());
        assert!(context_warning(None, &pool).is_none());
    }

    #[test]
    fn context_warning_picks_the_critical_string_above_the_critical_threshold() {
        let pool = SessionPool::new(PoolOptions::default());
        let message = context_warning(Some(92.0), &pool)
            .unwrap_or_else(|| panic!("expected a warning message"));
        assert!(message.contains("🚨"));
        assert!(message.contains("92%"));
        assert!(message.contains("(95%)"));
    }

    #[test]
    fn context_warning_picks_the_warn_string_in_the_warn_band() {
        let pool = SessionPool::new(PoolOptions::default());
        let message = context_warning(Some(85.0), &pool)
            .unwrap_or_else(|| panic!("expected a warning message"));
        assert!(message.contains("⚠️"));
        assert!(message.contains("85%"));
    }

    #[test]
    fn resolve_session_key_prefers_the_explicit_header_over_everything() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-kiro-session-id",
            "explicit-key"
                .parse()
                .unwrap_or_else(|error| panic!("valid header value: {error}")),
        );
        headers.insert(
            "x-openclaw-session-key",
            "discord:channel:1"
                .parse()
                .unwrap_or_else(|error| panic!("valid header value: {error}")),
        );
        let request: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}],"user":"body-key"}"#)
                .unwrap_or_else(|error| panic!("valid request json: {error}"));
        assert_eq!(resolve_session_key(&headers, &request), "explicit-key");
    }

    #[test]
    fn resolve_session_key_falls_back_to_body_user_then_fingerprint() {
        let headers = HeaderMap::new();
        let request: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}],"user":"body-key"}"#)
                .unwrap_or_else(|error| panic!("valid request json: {error}"));
        assert_eq!(resolve_session_key(&headers, &request), "body-key");

        let request_no_user: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#)
                .unwrap_or_else(|error| panic!("valid request json: {error}"));
        let key = resolve_session_key(&headers, &request_no_user);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn resolve_session_key_skips_a_blank_explicit_header_in_favor_of_the_next_signal() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-kiro-session-id",
            "   "
                .parse()
                .unwrap_or_else(|error| panic!("valid header value: {error}")),
        );
        headers.insert(
            "x-openclaw-session-key",
            "discord:channel:1"
                .parse()
                .unwrap_or_else(|error| panic!("valid header value: {error}")),
        );
        let request: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}],"user":"body-key"}"#)
                .unwrap_or_else(|error| panic!("valid request json: {error}"));
        assert_eq!(
            resolve_session_key(&headers, &request),
            "discord:channel:1"
        );
    }
}
