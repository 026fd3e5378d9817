//! Persistence collaborator
//!
//! Narrow interface to the product's storage layer: message history,
//! default channel resolution, and the chat audit trail. Every call is
//! best-effort from the gateway's point of view; a failed write must
//! never fail a live chat turn, so implementations log and degrade
//! instead of propagating errors.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// Direction of an audited chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// A chat message handed to storage.
#[derive(Debug, Clone, Default)]
pub struct StoredMessage {
    pub channel_id: String,
    pub user_id: Option<String>,
    pub role: String,
    pub content: String,
    pub content_type: String,
    pub structured_data: Option<Value>,
    pub metadata: Option<Value>,
    pub webhook_response: Option<Value>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub media_caption: Option<String>,
    pub correlation_id: Option<String>,
}

/// Storage collaborator consumed by the gateway.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Persist a message; `None` means the write failed (already logged).
    async fn save_message(&self, message: StoredMessage) -> Option<String>;

    /// Resolve (or lazily create) the user's default chat channel.
    async fn get_or_create_default_channel(&self, user_id: &str) -> Option<String>;

    /// Append an audit entry. Fire-and-forget by contract.
    async fn log_audit_message(&self, user_id: &str, direction: Direction, payload: Value);
}

/// Default implementation writing the audit trail to the `audit` log
/// target and acknowledging message saves without a backing store.
///
/// Deployments with a real database swap this out at the composition
/// root; the gateway only sees the trait.
#[derive(Debug, Default)]
pub struct AuditLogPersistence;

impl AuditLogPersistence {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Persistence for AuditLogPersistence {
    async fn save_message(&self, message: StoredMessage) -> Option<String> {
        let id = Uuid::new_v4().to_string();
        info!(
            target: "audit",
            id = %id,
            channel = %message.channel_id,
            role = %message.role,
            content_type = %message.content_type,
            "message stored"
        );
        Some(id)
    }

    async fn get_or_create_default_channel(&self, user_id: &str) -> Option<String> {
        Some(format!("channel-{user_id}"))
    }

    async fn log_audit_message(&self, user_id: &str, direction: Direction, payload: Value) {
        info!(
            target: "audit",
            user = %user_id,
            direction = direction.as_str(),
            payload = %payload,
            "chat audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audit_log_persistence_acknowledges_saves() {
        let store = AuditLogPersistence::new();
        let id = store
            .save_message(StoredMessage {
                channel_id: "channel-u1".to_string(),
                role: "user".to_string(),
                content: "hi".to_string(),
                content_type: "text".to_string(),
                ..Default::default()
            })
            .await;
        assert!(id.is_some());
    }

    #[tokio::test]
    async fn test_default_channel_is_stable_per_user() {
        let store = AuditLogPersistence::new();
        let a = store.get_or_create_default_channel("u1").await;
        let b = store.get_or_create_default_channel("u1").await;
        assert_eq!(a, b);
    }
}
