//! Configuration loading
//!
//! Typed configuration read from an optional JSON file and overridden by
//! `PULSEGATE_*` environment variables (env takes precedence, matching
//! the deployment convention for secrets like the gateway token).

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Default config file path, overridable via `PULSEGATE_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "pulsegate.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub bind: BindSettings,
    pub webhook: WebhookSettings,
    pub cache: CacheSettings,
    pub sessions: SessionSettings,
    pub rate_limit: RateLimitSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindSettings {
    pub address: String,
}

impl Default for BindSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookSettings {
    /// Target URL for the workflow webhook.
    pub url: String,
    /// Per-attempt request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Route classified commands through the response cache.
    pub cache_enabled: bool,
    /// Event name sent in the webhook envelope.
    pub event_name: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: 30_000,
            retry_attempts: 3,
            cache_enabled: true,
            event_name: "chat_message".to_string(),
        }
    }
}

impl WebhookSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 500,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// Staleness sweep interval in seconds.
    pub sweep_interval_secs: u64,
    /// Heartbeat age after which a session is considered dead.
    pub timeout_secs: u64,
    /// Server-side ping interval in seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            timeout_secs: 300,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitSettings {
    /// Window length shared by both limiters, in seconds.
    pub window_secs: u64,
    /// Requests per window per client IP (whole API surface).
    pub ip_limit: u32,
    /// Chat messages per window per user.
    pub user_limit: u32,
    /// Skip the IP limiter for loopback clients.
    pub exempt_loopback: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            ip_limit: 100,
            user_limit: 10,
            exempt_loopback: true,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSettings {
    /// External verifier endpoint; when set, bearer tokens are verified
    /// by POSTing them there.
    pub verify_url: Option<String>,
    /// Fallback static token for single-operator deployments.
    pub static_token: Option<String>,
}

/// Load configuration from the default path plus environment overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = env::var("PULSEGATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(Path::new(&path))
}

/// Load configuration from an explicit path; a missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str::<Config>(&raw)?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(bind) = env::var("PULSEGATE_BIND") {
        if !bind.trim().is_empty() {
            config.bind.address = bind;
        }
    }
    if let Ok(url) = env::var("PULSEGATE_WEBHOOK_URL") {
        if !url.trim().is_empty() {
            config.webhook.url = url;
        }
    }
    if let Ok(url) = env::var("PULSEGATE_AUTH_URL") {
        if !url.trim().is_empty() {
            config.auth.verify_url = Some(url);
        }
    }
    if let Ok(token) = env::var("PULSEGATE_STATIC_TOKEN") {
        if !token.trim().is_empty() {
            config.auth.static_token = Some(token);
        }
    }
}

/// Validate invariants that cannot be expressed through serde defaults.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.webhook.url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "webhook.url is required (or set PULSEGATE_WEBHOOK_URL)".to_string(),
        ));
    }
    if config.auth.verify_url.is_none() && config.auth.static_token.is_none() {
        return Err(ConfigError::Invalid(
            "one of auth.verifyUrl or auth.staticToken is required".to_string(),
        ));
    }
    if config.cache.max_entries == 0 {
        return Err(ConfigError::Invalid(
            "cache.maxEntries must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind.address, "127.0.0.1:8787");
        assert_eq!(config.webhook.retry_attempts, 3);
        assert!(config.webhook.cache_enabled);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.rate_limit.user_limit, 10);
    }

    #[test]
    fn test_parse_partial_file() {
        let raw = r#"{
            "webhook": { "url": "https://flows.example.com/hook", "retryAttempts": 2 },
            "rateLimit": { "userLimit": 5 }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.webhook.url, "https://flows.example.com/hook");
        assert_eq!(config.webhook.retry_attempts, 2);
        assert_eq!(config.rate_limit.user_limit, 5);
        // untouched sections keep defaults
        assert_eq!(config.sessions.timeout_secs, 300);
    }

    #[test]
    fn test_validate_requires_webhook_url() {
        let mut config = Config::default();
        config.auth.static_token = Some("tok".to_string());
        assert!(validate_config(&config).is_err());
        config.webhook.url = "https://flows.example.com/hook".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_requires_some_auth() {
        let mut config = Config::default();
        config.webhook.url = "https://flows.example.com/hook".to_string();
        assert!(validate_config(&config).is_err());
    }
}
