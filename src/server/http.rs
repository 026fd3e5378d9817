//! HTTP server
//!
//! Implements:
//! - WebSocket upgrade (GET /ws)
//! - Liveness endpoint (GET /health)
//! - Metrics text exposition (GET /metrics)
//! - Out-of-band assistant push (POST /messages/send)
//! - Per-IP rate limit middleware across the surface

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::messages::{Button, ContentType, OutgoingMessage};
use crate::persistence::{Direction, StoredMessage};
use crate::server::ratelimit::ip_rate_limit_middleware;
use crate::server::ws::{send_to_session, ws_handler};
use crate::server::AppState;

/// Assemble the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/messages/send", post(send_message))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ip_rate_limit_middleware,
        ))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": state.deps.started_at.elapsed().as_millis() as u64,
    }))
}

/// Prometheus-style text exposition of the gateway counters.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let deps = &state.deps;
    let cache = deps.cache.stats();
    let webhook = deps.webhook.stats();
    let lines: [(&str, u64); 9] = [
        ("cache_hits_total", cache.hits),
        ("cache_misses_total", cache.misses),
        ("cache_entries", cache.entries as u64),
        ("cache_inflight", cache.inflight as u64),
        ("cache_evictions_total", cache.evictions),
        ("sessions_active", deps.registry.active_count()),
        (
            "ratelimit_rejections_total",
            deps.ip_limiter.rejections() + deps.user_limiter.rejections(),
        ),
        ("webhook_attempts_total", webhook.attempts),
        ("webhook_failures_total", webhook.failures),
    ];
    let mut body = String::new();
    for (name, value) in lines {
        body.push_str(&format!("{name} {value}\n"));
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    structured_data: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    media_caption: Option<String>,
    #[serde(default)]
    buttons: Option<Vec<Button>>,
    #[serde(default)]
    correlation_id: Option<String>,
    /// Preferred target; the fallback chain still applies.
    #[serde(default)]
    session_id: Option<String>,
}

/// Push an assistant message to any live session of the authenticated
/// user. Used by downstream workflows whose replies arrive after the
/// originating chat turn already finished.
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let deps = &state.deps;
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        )
            .into_response();
    };
    let Some(user) = deps.verifier.verify(token).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid token" })),
        )
            .into_response();
    };

    let message = OutgoingMessage {
        correlation_id: request
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        content: request.content.filter(|c| !c.trim().is_empty()),
        content_type: request
            .content_type
            .as_deref()
            .and_then(ContentType::parse)
            .unwrap_or_default(),
        structured_data: request.structured_data,
        metadata: request.metadata,
        cache_tag: None,
        media_url: request.media_url,
        media_type: request.media_type,
        media_caption: request.media_caption,
        buttons: request.buttons,
        webhook_response: None,
    };
    if !message.is_deliverable() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "nothing to deliver" })),
        )
            .into_response();
    }

    let delivered = send_to_session(
        &deps.registry,
        request.session_id.as_deref(),
        &message,
        Some(&user.user_id),
        Some(&user.email),
    );
    if !delivered {
        // no live tab; park it in storage for later pickup
        if let Some(channel_id) = deps
            .persistence
            .get_or_create_default_channel(&user.user_id)
            .await
        {
            deps.persistence
                .save_message(StoredMessage {
                    channel_id,
                    user_id: None,
                    role: "assistant".to_string(),
                    content: message.content.clone().unwrap_or_default(),
                    content_type: message.content_type.as_str().to_string(),
                    structured_data: message.structured_data.clone(),
                    metadata: message.metadata.clone(),
                    media_url: message.media_url.clone(),
                    media_type: message.media_type.clone(),
                    media_caption: message.media_caption.clone(),
                    correlation_id: Some(message.correlation_id.clone()),
                    ..Default::default()
                })
                .await;
        }
    }
    deps.persistence
        .log_audit_message(
            &user.user_id,
            Direction::Out,
            json!({
                "correlationId": message.correlation_id,
                "delivered": delivered,
                "path": "push",
            }),
        )
        .await;

    Json(json!({
        "delivered": delivered,
        "correlationId": message.correlation_id,
    }))
    .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn test_send_request_defaults_to_text() {
        let raw = json!({ "content": "hello" });
        let request: SendMessageRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.content.as_deref(), Some("hello"));
        assert!(request.content_type.is_none());
        assert!(request.session_id.is_none());
    }
}
