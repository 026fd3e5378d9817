//! Workflow webhook client
//!
//! Classifies free-text chat commands into cacheable kinds, derives the
//! cache key for each, and invokes the external workflow webhook with a
//! per-attempt timeout and a bounded, precomputed backoff schedule. The
//! HTTP layer sits behind [`WebhookTransport`] so tests can count
//! attempts without a network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheService};
use crate::config::WebhookSettings;
use crate::messages::preview;
use crate::metrics::Counter;

/// Delay before retry N, capped at the last entry.
const BACKOFF_SCHEDULE_SECS: &[u64] = &[1, 2, 4, 8];

/// Longest message preview that may appear in logs.
const PREVIEW_CHARS: usize = 48;

/// One webhook attempt's failure mode.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned status {0}")]
    Status(u16),
}

/// HTTP seam for the webhook POST.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// reqwest-backed transport with connect and request timeouts.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if text.trim().is_empty() {
            // workflow acknowledged without an immediate reply
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "text": text })))
    }
}

/// What a chat command resolves to for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Trends,
    Topics { trend_id: String },
    Summary { topic_id: String },
}

/// Classify a free-text command.
///
/// `list-trends` and anything unrecognized are the trends class; a
/// `trend #<id>` reference asks for that trend's topics; any
/// `topic #<id>` reference (alone or alongside its trend) asks for a
/// summary of that topic.
pub fn classify_command(message: &str) -> CommandKind {
    let normalized = message.trim().to_lowercase();
    if normalized == "list-trends" {
        return CommandKind::Trends;
    }
    let topic = find_reference(&normalized, "topic");
    let trend = find_reference(&normalized, "trend");
    match (trend, topic) {
        (_, Some(topic_id)) => CommandKind::Summary { topic_id },
        (Some(trend_id), None) => CommandKind::Topics { trend_id },
        (None, None) => CommandKind::Trends,
    }
}

/// Find `<keyword> #<id>` in already-lowercased text.
fn find_reference(text: &str, keyword: &str) -> Option<String> {
    let mut rest = text;
    while let Some(pos) = rest.find(keyword) {
        let after = rest[pos + keyword.len()..].trim_start();
        if let Some(tail) = after.strip_prefix('#') {
            let id: String = tail
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if !id.is_empty() {
                return Some(id);
            }
        }
        rest = &rest[pos + keyword.len()..];
    }
    None
}

/// One-way hash of an email for use in cache keys; raw addresses never
/// enter key telemetry.
pub fn email_hash(email: &str) -> String {
    let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Synthetic remote identity sent upstream in place of the real address.
fn remote_identity(email: &str) -> String {
    let local: String = email
        .split('@')
        .next()
        .unwrap_or("user")
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '.' })
        .collect();
    format!("{}-{}@web.pulse", local, &email_hash(email)[..8])
}

/// Cache kind and parameters for a classified command.
///
/// Trends are daily; topics key on the trend and day; summaries are
/// additionally personalized via the hashed email.
fn cache_route(kind: &CommandKind, user_email: &str) -> (&'static str, Vec<(&'static str, String)>) {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    match kind {
        CommandKind::Trends => ("trends", vec![("d", date)]),
        CommandKind::Topics { trend_id } => {
            ("topics", vec![("d", date), ("trend", trend_id.clone())])
        }
        CommandKind::Summary { topic_id } => (
            "summary",
            vec![
                ("d", date),
                ("topic", topic_id.clone()),
                ("u", email_hash(user_email)),
            ],
        ),
    }
}

fn backoff_delay(retry_index: u32) -> Duration {
    let idx = (retry_index as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[idx])
}

struct Core {
    settings: WebhookSettings,
    transport: Arc<dyn WebhookTransport>,
    attempts: Counter,
    failures: Counter,
}

impl Core {
    /// POST the envelope, retrying per the backoff schedule. Exhausting
    /// the budget surfaces the last attempt's error.
    async fn invoke(&self, payload: Value) -> Result<Value, WebhookError> {
        let total_attempts = self.settings.retry_attempts + 1;
        let msg_preview = payload
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| preview(s, PREVIEW_CHARS))
            .unwrap_or_default();
        let mut last_error = TransportError::Network("no attempt made".to_string());
        for attempt in 1..=total_attempts {
            if attempt > 1 {
                sleep(backoff_delay(attempt - 2)).await;
            }
            self.attempts.inc();
            debug!(
                target: "webhook",
                attempt,
                total = total_attempts,
                preview = %msg_preview,
                "posting to workflow webhook"
            );
            match self.transport.post(&self.settings.url, &payload).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.failures.inc();
                    warn!(
                        target: "webhook",
                        attempt,
                        total = total_attempts,
                        error = %err,
                        preview = %msg_preview,
                        "webhook attempt failed"
                    );
                    last_error = err;
                }
            }
        }
        Err(WebhookError::Exhausted {
            attempts: total_attempts,
            last: last_error,
        })
    }
}

/// Attempt counters for the metrics surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookStats {
    pub attempts: u64,
    pub failures: u64,
}

/// Client for the external workflow webhook, optionally routed through
/// the response cache.
pub struct WebhookClient {
    core: Arc<Core>,
    cache: Option<Arc<CacheService<Value>>>,
}

impl WebhookClient {
    pub fn new(
        settings: WebhookSettings,
        transport: Arc<dyn WebhookTransport>,
        cache: Option<Arc<CacheService<Value>>>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                settings,
                transport,
                attempts: Counter::new(),
                failures: Counter::new(),
            }),
            cache,
        }
    }

    pub fn stats(&self) -> WebhookStats {
        WebhookStats {
            attempts: self.core.attempts.get(),
            failures: self.core.failures.get(),
        }
    }

    /// Send a chat message upstream, serving classified commands through
    /// the cache when enabled. The uncached path is taken when caching is
    /// disabled or no cache was attached at construction.
    pub async fn send_message(
        &self,
        user_email: &str,
        message: &str,
        session_id: &str,
        correlation_id: &str,
        user_id: &str,
    ) -> Result<Value, WebhookError> {
        let envelope = json!({
            "event": self.core.settings.event_name,
            "remoteId": remote_identity(user_email),
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
            "sessionId": session_id,
            "correlationId": correlation_id,
            "userId": user_id,
        });

        match &self.cache {
            Some(cache) if self.core.settings.cache_enabled => {
                let kind = classify_command(message);
                let (cache_kind, params) = cache_route(&kind, user_email);
                let param_refs: Vec<(&str, &str)> =
                    params.iter().map(|(k, v)| (*k, v.as_str())).collect();
                let core = Arc::clone(&self.core);
                cache
                    .fetch_with_cache(cache_kind, &param_refs, move || async move {
                        core.invoke(envelope).await
                    })
                    .await
                    .map_err(WebhookError::from)
            }
            _ => self.core.invoke(envelope).await,
        }
    }
}
