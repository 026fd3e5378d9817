//! Canonical chat message types
//!
//! The stable outbound contract every upstream payload is normalized
//! into before it reaches a socket, plus small helpers shared by the
//! gateway and the webhook client.

pub mod normalize;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Fixed set of content types the client UI understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Video,
    Link,
    Trends,
    Topics,
    Summary,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Link => "link",
            ContentType::Trends => "trends",
            ContentType::Topics => "topics",
            ContentType::Summary => "summary",
        }
    }

    /// Parse a wire value; unknown strings yield `None` so callers can
    /// apply their own default.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(ContentType::Text),
            "image" => Some(ContentType::Image),
            "video" => Some(ContentType::Video),
            "link" => Some(ContentType::Link),
            "trends" => Some(ContentType::Trends),
            "topics" => Some(ContentType::Topics),
            "summary" => Some(ContentType::Summary),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Quick-reply button attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub value: String,
}

/// Canonical, normalized assistant message.
///
/// Everything except `correlation_id` and `content_type` is optional;
/// a message with no meaningful field is not deliverable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub correlation_id: String,
    pub content: Option<String>,
    pub content_type: ContentType,
    pub structured_data: Option<Value>,
    pub metadata: Option<Value>,
    pub cache_tag: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub media_caption: Option<String>,
    pub buttons: Option<Vec<Button>>,
    pub webhook_response: Option<Value>,
}

impl OutgoingMessage {
    /// True when there is anything worth pushing to a client.
    pub fn is_deliverable(&self) -> bool {
        self.content.is_some()
            || self.structured_data.is_some()
            || self.media_url.is_some()
            || self.buttons.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Serialize to the outbound `message` wire frame.
    pub fn to_frame(&self) -> Value {
        let mut frame = Map::new();
        frame.insert("type".to_string(), json!("message"));
        frame.insert("role".to_string(), json!("assistant"));
        frame.insert("correlationId".to_string(), json!(self.correlation_id));
        if let Some(content) = &self.content {
            frame.insert("content".to_string(), json!(content));
        }
        frame.insert("contentType".to_string(), json!(self.content_type.as_str()));
        if let Some(data) = &self.structured_data {
            frame.insert("structuredData".to_string(), data.clone());
        }
        if let Some(metadata) = &self.metadata {
            frame.insert("metadata".to_string(), metadata.clone());
        }
        if let Some(tag) = &self.cache_tag {
            frame.insert("cacheTag".to_string(), json!(tag));
        }
        if let Some(buttons) = &self.buttons {
            frame.insert("buttons".to_string(), json!(buttons));
        }
        if let Some(url) = &self.media_url {
            frame.insert("mediaUrl".to_string(), json!(url));
        }
        if let Some(media_type) = &self.media_type {
            frame.insert("mediaType".to_string(), json!(media_type));
        }
        if let Some(caption) = &self.media_caption {
            frame.insert("mediaCaption".to_string(), json!(caption));
        }
        if let Some(raw) = &self.webhook_response {
            frame.insert("webhookResponse".to_string(), raw.clone());
        }
        Value::Object(frame)
    }
}

/// Truncated single-line preview for logs and audit entries. Chat
/// payloads are never logged in full.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let truncated: String = flat.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_round_trip() {
        for raw in ["text", "image", "video", "link", "trends", "topics", "summary"] {
            let parsed = ContentType::parse(raw).unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
        assert!(ContentType::parse("gif").is_none());
    }

    #[test]
    fn test_empty_message_is_not_deliverable() {
        let msg = OutgoingMessage {
            correlation_id: "c-1".to_string(),
            ..Default::default()
        };
        assert!(!msg.is_deliverable());
    }

    #[test]
    fn test_buttons_alone_are_deliverable_unless_empty() {
        let mut msg = OutgoingMessage {
            correlation_id: "c-1".to_string(),
            buttons: Some(vec![]),
            ..Default::default()
        };
        assert!(!msg.is_deliverable());
        msg.buttons = Some(vec![Button {
            label: "More".to_string(),
            value: "more".to_string(),
        }]);
        assert!(msg.is_deliverable());
    }

    #[test]
    fn test_frame_omits_absent_fields() {
        let msg = OutgoingMessage {
            correlation_id: "c-1".to_string(),
            content: Some("hello".to_string()),
            ..Default::default()
        };
        let frame = msg.to_frame();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["role"], "assistant");
        assert_eq!(frame["correlationId"], "c-1");
        assert_eq!(frame["content"], "hello");
        assert_eq!(frame["contentType"], "text");
        assert!(frame.get("structuredData").is_none());
        assert!(frame.get("mediaUrl").is_none());
    }

    #[test]
    fn test_preview_truncates_and_flattens() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("line\nbreak", 20), "line break");
        let long = "x".repeat(50);
        let p = preview(&long, 10);
        assert_eq!(p.chars().count(), 11);
        assert!(p.ends_with('…'));
    }
}
