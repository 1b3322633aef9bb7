//! The axum route table, CORS, and the non-completions routes (`/health`,
//! `/`, `/v1/models`, `/sessions`).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use kirogate_server::pool::SessionPool;

use crate::bridge;
use crate::router::Router as ChannelRouter;
use crate::wire::ModelsResponse;

/// Shared state handed to every axum handler.
pub struct GatewayState {
    pub pool: Arc<SessionPool>,
    pub router: Arc<ChannelRouter>,
}

pub fn build_router(state: Arc<GatewayState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/v1/models", get(models_handler))
        .route("/sessions", get(sessions_handler))
        .route("/v1/chat/completions", post(bridge::handle_completions))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Kiro-Session-Id"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "kirogate"}))
}

async fn models_handler() -> impl IntoResponse {
    Json(ModelsResponse::synthetic(Utc::now().timestamp()))
}

/// `/sessions`: pool diagnostics, one entry per live session.
#[derive(Debug, Serialize)]
struct SessionDiagnosticsEntry {
    key_prefix: String,
    context_pct: Option<f64>,
    idle_secs: u64,
    rss_kb: Option<u64>,
    consecutive_errors: u32,
    prompting: bool,
    agent_session_id: String,
    pid: u32,
}

async fn sessions_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let entries: Vec<SessionDiagnosticsEntry> = state
        .pool
        .diagnostics()
        .await
        .into_iter()
        .map(|diag| SessionDiagnosticsEntry {
            key_prefix: diag.key.chars().take(8).collect(),
            context_pct: diag.context_pct,
            idle_secs: diag.idle_secs,
            rss_kb: diag.rss_kb,
            consecutive_errors: diag.consecutive_errors,
            prompting: diag.prompting,
            agent_session_id: diag.agent_session_id,
            pid: diag.pid,
        })
        .collect();
    Json(entries)
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"message": "Not found"}})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_cors_headers_sets_the_three_documented_headers() {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response);
        let headers = response.headers();
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap_or_else(|| panic!("missing allow-origin header")),
            "*"
        );
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
                .unwrap_or_else(|| panic!("missing allow-headers header")),
            "Content-Type, Authorization, X-Kiro-Session-Id"
        );
        assert_eq!(
            headers
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .unwrap_or_else(|| panic!("missing allow-methods header")),
            "GET, POST, OPTIONS"
        );
    }
}
