//! WebSocket gateway
//!
//! Accepts inbound socket connections, authenticates the bearer token
//! from the query string, registers a session, and runs the
//! per-connection frame loop. Inbound frames are processed strictly in
//! arrival order; outbound frames go through one writer task per
//! connection so `typing_start` is always observed before the reply it
//! announces.
//!
//! Connection lifecycle: connecting → authenticated → active → closed.
//! Auth failure closes the socket before any session exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::messages::normalize::normalize_response;
use crate::messages::{preview, OutgoingMessage};
use crate::persistence::{Direction, StoredMessage};
use crate::server::{AppDeps, AppState};
use crate::sessions::{SessionRegistry, SessionTransport, TransportClosed};

/// Close code for rejected handshakes (policy violation).
const CLOSE_POLICY: u16 = 1008;

const AUDIT_PREVIEW_CHARS: usize = 48;

/// Outbound half of a live socket: frames are queued on the writer
/// channel and flushed by the per-connection send task.
struct WsTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl SessionTransport for WsTransport {
    fn send_text(&self, text: String) -> Result<(), TransportClosed> {
        self.tx.send(Message::Text(text)).map_err(|_| TransportClosed)
    }

    fn close(&self, reason: &str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        })));
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: HashMap<String, String>) {
    let deps = state.deps;
    let (mut sender, mut receiver) = socket.split();

    let token = params.get("token").map(String::as_str).unwrap_or("");
    let user = if token.is_empty() {
        None
    } else {
        deps.verifier.verify(token).await
    };
    let Some(user) = user else {
        debug!(target: "gateway", "handshake rejected: authentication failed");
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY,
                reason: "authentication failed".into(),
            })))
            .await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let transport = Arc::new(WsTransport { tx: tx.clone() });
    let session = deps
        .registry
        .create_session(transport, &user.user_id, &user.email, None);
    let session_id = session.id.clone();
    info!(
        target: "gateway",
        session = %session_id,
        user = %user.user_id,
        "connection authenticated"
    );
    let _ = tx.send(Message::Text(
        json!({ "type": "connected", "sessionId": session_id }).to_string(),
    ));

    // Server-side heartbeat; a dead writer channel removes the session.
    let hb_tx = tx.clone();
    let hb_registry = deps.registry.clone();
    let hb_session = session_id.clone();
    let hb_interval = Duration::from_secs(deps.config.sessions.heartbeat_interval_secs.max(1));
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hb_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if hb_registry.get_session(&hb_session).is_none() {
                break;
            }
            if hb_tx.send(Message::Ping(Vec::new())).is_err() {
                hb_registry.remove_session(&hb_session);
                break;
            }
        }
    });

    while let Some(next) = receiver.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => handle_frame(&deps, &session_id, &user, &text).await,
            Message::Pong(_) => {
                if !deps.registry.update_heartbeat(&session_id) {
                    break;
                }
            }
            // transport-level pings are answered by the protocol layer
            Message::Ping(_) => {}
            Message::Binary(_) => {
                warn!(target: "gateway", session = %session_id, "ignoring binary frame");
            }
            Message::Close(_) => break,
        }
    }

    heartbeat_task.abort();
    deps.registry.remove_session(&session_id);
    drop(tx);
    let _ = send_task.await;
    debug!(target: "gateway", session = %session_id, "connection closed");
}

/// Dispatch one inbound frame. Unknown types are logged and ignored so
/// newer clients keep working against older gateways.
async fn handle_frame(
    deps: &Arc<AppDeps>,
    session_id: &str,
    user: &AuthenticatedUser,
    text: &str,
) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target: "gateway", session = %session_id, error = %err, "malformed inbound frame");
            send_frame(
                &deps.registry,
                session_id,
                &json!({ "type": "error", "error": "malformed frame" }),
            );
            return;
        }
    };
    match frame.frame_type.as_str() {
        "ping" => {
            deps.registry.update_heartbeat(session_id);
            send_frame(&deps.registry, session_id, &json!({ "type": "pong" }));
        }
        "message" => {
            let content = frame.content.unwrap_or_default();
            if content.trim().is_empty() {
                debug!(target: "gateway", session = %session_id, "empty chat message ignored");
                return;
            }
            handle_chat_message(deps, session_id, user, &content).await;
        }
        "typing_start" | "typing_stop" => {
            debug!(
                target: "gateway",
                session = %session_id,
                kind = %frame.frame_type,
                "presence frame ignored"
            );
        }
        "read_receipt" => {
            info!(
                target: "gateway",
                session = %session_id,
                message_id = ?frame.message_id,
                "read receipt"
            );
        }
        other => {
            warn!(
                target: "gateway",
                session = %session_id,
                frame_type = %other,
                "unknown frame type ignored"
            );
        }
    }
}

/// The chat pipeline for one inbound message.
async fn handle_chat_message(
    deps: &Arc<AppDeps>,
    session_id: &str,
    user: &AuthenticatedUser,
    content: &str,
) {
    let correlation_id = Uuid::new_v4().to_string();
    let registry = &deps.registry;

    if !deps
        .user_limiter
        .check(&user.user_id, deps.config.rate_limit.user_limit)
    {
        warn!(target: "gateway", user = %user.user_id, "chat rate limit exceeded");
        send_frame(
            registry,
            session_id,
            &json!({
                "type": "error",
                "error": "rate limit exceeded, slow down",
                "correlationId": correlation_id,
            }),
        );
        return;
    }

    // History and audit are best-effort; a storage problem must never
    // fail a live chat turn.
    let channel_id = deps
        .persistence
        .get_or_create_default_channel(&user.user_id)
        .await;
    if let Some(channel_id) = &channel_id {
        deps.persistence
            .save_message(StoredMessage {
                channel_id: channel_id.clone(),
                user_id: Some(user.user_id.clone()),
                role: "user".to_string(),
                content: content.to_string(),
                content_type: "text".to_string(),
                correlation_id: Some(correlation_id.clone()),
                ..Default::default()
            })
            .await;
    }
    deps.persistence
        .log_audit_message(
            &user.user_id,
            Direction::In,
            json!({
                "sessionId": session_id,
                "correlationId": correlation_id,
                "preview": preview(content, AUDIT_PREVIEW_CHARS),
            }),
        )
        .await;

    send_frame(registry, session_id, &json!({ "type": "typing_start" }));

    let result = deps
        .webhook
        .send_message(&user.email, content, session_id, &correlation_id, &user.user_id)
        .await;

    send_frame(registry, session_id, &json!({ "type": "typing_stop" }));

    let raw = match result {
        Ok(raw) => raw,
        Err(err) => {
            warn!(
                target: "gateway",
                correlation = %correlation_id,
                error = %err,
                "chat turn failed upstream"
            );
            send_frame(
                registry,
                session_id,
                &json!({
                    "type": "error",
                    "error": err.to_string(),
                    "correlationId": correlation_id,
                }),
            );
            return;
        }
    };

    match normalize_response(&raw, &correlation_id) {
        Some(message) => {
            let delivered = send_to_session(
                registry,
                Some(session_id),
                &message,
                Some(&user.user_id),
                Some(&user.email),
            );
            // undelivered replies land in storage for the out-of-band
            // push path to pick up
            if let Some(channel_id) = &channel_id {
                deps.persistence
                    .save_message(StoredMessage {
                        channel_id: channel_id.clone(),
                        user_id: None,
                        role: "assistant".to_string(),
                        content: message.content.clone().unwrap_or_default(),
                        content_type: message.content_type.as_str().to_string(),
                        structured_data: message.structured_data.clone(),
                        metadata: message.metadata.clone(),
                        webhook_response: message.webhook_response.clone(),
                        media_url: message.media_url.clone(),
                        media_type: message.media_type.clone(),
                        media_caption: message.media_caption.clone(),
                        correlation_id: Some(message.correlation_id.clone()),
                    })
                    .await;
            }
            deps.persistence
                .log_audit_message(
                    &user.user_id,
                    Direction::Out,
                    json!({
                        "correlationId": message.correlation_id,
                        "contentType": message.content_type.as_str(),
                        "delivered": delivered,
                    }),
                )
                .await;
        }
        None => {
            info!(
                target: "gateway",
                correlation = %correlation_id,
                "no immediate reply; downstream workflow will push later"
            );
            deps.persistence
                .log_audit_message(
                    &user.user_id,
                    Direction::Out,
                    json!({
                        "correlationId": correlation_id,
                        "delivered": false,
                        "note": "no immediate content",
                    }),
                )
                .await;
        }
    }
}

/// Send one frame to a specific session, re-resolving it through the
/// registry first. False when the session is gone or its transport is
/// not open.
pub fn send_frame(registry: &SessionRegistry, session_id: &str, frame: &Value) -> bool {
    let Some(session) = registry.get_session(session_id) else {
        return false;
    };
    if !session.transport.is_open() {
        return false;
    }
    session.transport.send_text(frame.to_string()).is_ok()
}

/// Deliver a normalized message with the fallback chain: the originating
/// session, then every other session of the same user, then the session
/// resolved by email. Transport failures on one attempt never abort the
/// rest; false means no live session accepted the frame.
pub fn send_to_session(
    registry: &SessionRegistry,
    session_id: Option<&str>,
    message: &OutgoingMessage,
    user_id: Option<&str>,
    user_email: Option<&str>,
) -> bool {
    let frame = message.to_frame().to_string();
    let mut attempted: Vec<String> = Vec::new();

    if let Some(primary) = session_id {
        if try_deliver(registry, primary, &frame) {
            return true;
        }
        attempted.push(primary.to_string());
    }

    if let Some(user_id) = user_id {
        for session in registry.sessions_for_user(user_id) {
            if attempted.iter().any(|id| id == &session.id) {
                continue;
            }
            if try_deliver(registry, &session.id, &frame) {
                debug!(
                    target: "gateway",
                    session = %session.id,
                    correlation = %message.correlation_id,
                    "delivered via user fallback"
                );
                return true;
            }
            attempted.push(session.id);
        }
    }

    if let Some(email) = user_email {
        if let Some(session) = registry.session_by_email(email) {
            if !attempted.iter().any(|id| id == &session.id)
                && try_deliver(registry, &session.id, &frame)
            {
                debug!(
                    target: "gateway",
                    session = %session.id,
                    correlation = %message.correlation_id,
                    "delivered via email fallback"
                );
                return true;
            }
        }
    }

    warn!(
        target: "gateway",
        correlation = %message.correlation_id,
        "no live session accepted delivery"
    );
    false
}

fn try_deliver(registry: &SessionRegistry, session_id: &str, frame: &str) -> bool {
    let Some(session) = registry.get_session(session_id) else {
        return false;
    };
    if !session.transport.is_open() {
        return false;
    }
    match session.transport.send_text(frame.to_string()) {
        Ok(()) => true,
        Err(err) => {
            debug!(
                target: "gateway",
                session = %session_id,
                error = %err,
                "delivery attempt failed"
            );
            false
        }
    }
}
