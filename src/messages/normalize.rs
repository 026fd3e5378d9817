//! Upstream payload normalization
//!
//! Workflow engines return replies in no contractually fixed shape:
//! bare objects, arrays of steps, nested `output` envelopes, camelCase
//! or snake_case field names. This module flattens whatever arrives
//! into a candidate list and resolves each field of the canonical
//! [`OutgoingMessage`] from a fixed probe list — never by reflecting on
//! arbitrary field names. A payload where every probe comes up empty
//! means "nothing to deliver" (the workflow only triggered an async
//! branch with no immediate reply).

use serde_json::{Map, Value};

use crate::messages::{Button, ContentType, OutgoingMessage};

/// Field aliases for the reply text, in priority order.
const CONTENT_PROBES: &[&str] = &[
    "text",
    "message",
    "response",
    "content",
    "reply",
    "summary",
    "headline",
    "description",
    "title",
    "body.content",
    "body.text",
    "data.content",
    "data.text",
    "data.message",
];

const CORRELATION_PROBES: &[&str] = &[
    "correlationId",
    "correlation_id",
    "data.correlationId",
    "data.correlation_id",
];

const CONTENT_TYPE_PROBES: &[&str] = &[
    "contentType",
    "content_type",
    "data.contentType",
    "data.content_type",
];

const STRUCTURED_DATA_PROBES: &[&str] = &[
    "structuredData",
    "structured_data",
    "data.structuredData",
    "data.structured_data",
];

const METADATA_PROBES: &[&str] = &["metadata", "data.metadata"];

const CACHE_TAG_PROBES: &[&str] = &["cacheTag", "cache_tag", "data.cacheTag", "data.cache_tag"];

const MEDIA_OBJECT_PROBES: &[&str] = &["media", "mediaPayload", "media_payload", "data.media"];
const MEDIA_URL_PROBES: &[&str] = &["mediaUrl", "media_url"];
const MEDIA_TYPE_PROBES: &[&str] = &["mediaType", "media_type"];
const MEDIA_CAPTION_PROBES: &[&str] = &["mediaCaption", "media_caption"];

const BUTTONS_PROBES: &[&str] = &["buttons", "data.buttons"];

const WEBHOOK_RESPONSE_PROBES: &[&str] = &["webhookResponse", "webhook_response"];

const BUTTON_LABEL_KEYS: &[&str] = &["label", "title", "text", "name"];
const BUTTON_VALUE_KEYS: &[&str] = &["value", "id", "payload", "action"];

/// Normalize a raw upstream result into the canonical outbound message.
///
/// Returns `None` when nothing deliverable could be resolved.
pub fn normalize_response(raw: &Value, local_correlation_id: &str) -> Option<OutgoingMessage> {
    let mut candidates: Vec<&Map<String, Value>> = Vec::new();
    collect_candidates(raw, &mut candidates);

    let correlation_id = probe_string(&candidates, CORRELATION_PROBES)
        .unwrap_or_else(|| local_correlation_id.to_string());
    let content = probe_string(&candidates, CONTENT_PROBES);
    let structured_data = probe_value(&candidates, STRUCTURED_DATA_PROBES).cloned();
    let metadata = probe_value(&candidates, METADATA_PROBES).cloned();
    let cache_tag = probe_string(&candidates, CACHE_TAG_PROBES);
    let (media_url, media_type, media_caption) = probe_media(&candidates);
    let buttons = probe_buttons(&candidates);
    let explicit_webhook_response = probe_value(&candidates, WEBHOOK_RESPONSE_PROBES).cloned();

    // Structured payloads predate explicit content types upstream and
    // historically always meant a trend digest; kept for compatibility.
    let content_type = probe_string(&candidates, CONTENT_TYPE_PROBES)
        .and_then(|raw| ContentType::parse(&raw))
        .unwrap_or(if structured_data.is_some() {
            ContentType::Trends
        } else {
            ContentType::Text
        });

    let message = OutgoingMessage {
        correlation_id,
        content,
        content_type,
        structured_data,
        metadata,
        cache_tag,
        media_url,
        media_type,
        media_caption,
        buttons,
        webhook_response: None,
    };
    if !message.is_deliverable() {
        return None;
    }
    Some(OutgoingMessage {
        webhook_response: Some(explicit_webhook_response.unwrap_or_else(|| raw.clone())),
        ..message
    })
}

/// Flatten the payload tree into the candidate object list: arrays are
/// recursed, and `output` envelopes are unwrapped wherever they appear.
fn collect_candidates<'a>(value: &'a Value, out: &mut Vec<&'a Map<String, Value>>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_candidates(item, out);
            }
        }
        Value::Object(obj) => {
            out.push(obj);
            if let Some(output) = obj.get("output") {
                collect_candidates(output, out);
            }
        }
        _ => {}
    }
}

/// Resolve a dotted path one level deep against an object.
fn lookup<'a>(obj: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let value = match path.split_once('.') {
        Some((head, tail)) => obj.get(head)?.as_object()?.get(tail)?,
        None => obj.get(path)?,
    };
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

fn probe_value<'a>(candidates: &[&'a Map<String, Value>], paths: &[&str]) -> Option<&'a Value> {
    for candidate in candidates {
        for path in paths {
            if let Some(value) = lookup(candidate, path) {
                return Some(value);
            }
        }
    }
    None
}

fn probe_string(candidates: &[&Map<String, Value>], paths: &[&str]) -> Option<String> {
    for candidate in candidates {
        for path in paths {
            if let Some(text) = lookup(candidate, path).and_then(value_as_text) {
                return Some(text);
            }
        }
    }
    None
}

/// Strings pass through; numbers are stringified (ids arrive both ways).
fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn probe_media(candidates: &[&Map<String, Value>]) -> (Option<String>, Option<String>, Option<String>) {
    let mut url = probe_string(candidates, MEDIA_URL_PROBES);
    let mut media_type = probe_string(candidates, MEDIA_TYPE_PROBES);
    let mut caption = probe_string(candidates, MEDIA_CAPTION_PROBES);

    if url.is_none() {
        if let Some(media) = probe_value(candidates, MEDIA_OBJECT_PROBES).and_then(Value::as_object)
        {
            url = lookup(media, "url")
                .or_else(|| lookup(media, "mediaUrl"))
                .or_else(|| lookup(media, "media_url"))
                .and_then(value_as_text);
            media_type = media_type.or_else(|| {
                lookup(media, "type")
                    .or_else(|| lookup(media, "mediaType"))
                    .or_else(|| lookup(media, "media_type"))
                    .and_then(value_as_text)
            });
            caption = caption.or_else(|| {
                lookup(media, "caption")
                    .or_else(|| lookup(media, "mediaCaption"))
                    .or_else(|| lookup(media, "media_caption"))
                    .and_then(value_as_text)
            });
        }
    }
    (url, media_type, caption)
}

fn probe_buttons(candidates: &[&Map<String, Value>]) -> Option<Vec<Button>> {
    let raw = probe_value(candidates, BUTTONS_PROBES)?;
    // accept either a bare array or an object wrapping a `buttons` array
    let items = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj.get("buttons")?.as_array()?.as_slice(),
        _ => return None,
    };
    let buttons: Vec<Button> = items.iter().filter_map(normalize_button).collect();
    if buttons.is_empty() {
        None
    } else {
        Some(buttons)
    }
}

/// Normalize one button entry to `{label, value}`, synthesizing one side
/// from the other when only one is present. Bare strings are both.
fn normalize_button(entry: &Value) -> Option<Button> {
    match entry {
        Value::String(s) if !s.trim().is_empty() => Some(Button {
            label: s.clone(),
            value: s.clone(),
        }),
        Value::Object(obj) => {
            let label = BUTTON_LABEL_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(value_as_text));
            let value = BUTTON_VALUE_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(value_as_text));
            match (label, value) {
                (Some(label), Some(value)) => Some(Button { label, value }),
                (Some(label), None) => Some(Button {
                    value: label.clone(),
                    label,
                }),
                (None, Some(value)) => Some(Button {
                    label: value.clone(),
                    value,
                }),
                (None, None) => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_content_field() {
        let msg = normalize_response(&json!({"content": "hi"}), "c-1").unwrap();
        assert_eq!(msg.content.as_deref(), Some("hi"));
        assert_eq!(msg.content_type, ContentType::Text);
        assert_eq!(msg.correlation_id, "c-1");
    }

    #[test]
    fn test_output_envelope_text() {
        let msg = normalize_response(&json!({"output": {"text": "hi"}}), "c-1").unwrap();
        assert_eq!(msg.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_deeply_nested_array_output_data() {
        let raw = json!([{"output": [{"data": {"content": "hi"}}]}]);
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_empty_object_is_nothing_to_deliver() {
        assert!(normalize_response(&json!({}), "c-1").is_none());
        assert!(normalize_response(&json!(null), "c-1").is_none());
        assert!(normalize_response(&json!("bare string"), "c-1").is_none());
        assert!(normalize_response(&json!([{}, {"status": true}]), "c-1").is_none());
    }

    #[test]
    fn test_upstream_correlation_id_wins() {
        let raw = json!({"correlation_id": "up-9", "message": "ok"});
        let msg = normalize_response(&raw, "local-1").unwrap();
        assert_eq!(msg.correlation_id, "up-9");
    }

    #[test]
    fn test_structured_data_defaults_type_to_trends() {
        let raw = json!({"structuredData": {"trends": [1, 2, 3]}});
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.content_type, ContentType::Trends);
        assert!(msg.content.is_none());
        assert_eq!(msg.structured_data, Some(json!({"trends": [1, 2, 3]})));
    }

    #[test]
    fn test_explicit_content_type_respected() {
        let raw = json!({"content": "see this", "content_type": "link"});
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.content_type, ContentType::Link);
    }

    #[test]
    fn test_unknown_content_type_falls_back() {
        let raw = json!({"content": "x", "contentType": "carousel"});
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.content_type, ContentType::Text);
    }

    #[test]
    fn test_media_from_nested_object() {
        let raw = json!({
            "content": "look",
            "media": {"url": "https://cdn.example.com/a.png", "type": "image/png", "caption": "A"}
        });
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.media_url.as_deref(), Some("https://cdn.example.com/a.png"));
        assert_eq!(msg.media_type.as_deref(), Some("image/png"));
        assert_eq!(msg.media_caption.as_deref(), Some("A"));
    }

    #[test]
    fn test_media_from_flat_snake_case_fields() {
        let raw = json!({"content": "look", "media_url": "https://x/y.jpg"});
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.media_url.as_deref(), Some("https://x/y.jpg"));
    }

    #[test]
    fn test_buttons_bare_array_of_strings() {
        let raw = json!({"content": "pick", "buttons": ["Mais", "Resumo"]});
        let msg = normalize_response(&raw, "c-1").unwrap();
        let buttons = msg.buttons.unwrap();
        assert_eq!(buttons[0].label, "Mais");
        assert_eq!(buttons[0].value, "Mais");
        assert_eq!(buttons.len(), 2);
    }

    #[test]
    fn test_buttons_wrapped_object_and_synthesis() {
        let raw = json!({
            "content": "pick",
            "buttons": {"buttons": [
                {"title": "Trend 1", "payload": "trend #1"},
                {"label": "Only label"},
                {"id": 42}
            ]}
        });
        let msg = normalize_response(&raw, "c-1").unwrap();
        let buttons = msg.buttons.unwrap();
        assert_eq!(buttons.len(), 3);
        assert_eq!(buttons[0].label, "Trend 1");
        assert_eq!(buttons[0].value, "trend #1");
        assert_eq!(buttons[1].value, "Only label");
        assert_eq!(buttons[2].label, "42");
    }

    #[test]
    fn test_buttons_alone_are_deliverable() {
        let raw = json!({"buttons": ["Sim"]});
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert!(msg.is_deliverable());
        assert!(msg.content.is_none());
    }

    #[test]
    fn test_first_candidate_wins_across_array() {
        let raw = json!([
            {"message": "first"},
            {"message": "second"}
        ]);
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.content.as_deref(), Some("first"));
    }

    #[test]
    fn test_raw_response_attached_when_deliverable() {
        let raw = json!({"reply": "ok"});
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.webhook_response, Some(raw));
    }

    #[test]
    fn test_body_nesting_one_level() {
        let raw = json!({"body": {"content": "nested"}});
        let msg = normalize_response(&raw, "c-1").unwrap();
        assert_eq!(msg.content.as_deref(), Some("nested"));
    }
}
