//! Rate limiting
//!
//! Generic fixed-window counter keyed by an arbitrary string. Two
//! instances exist at runtime: one keyed by client IP (applied as axum
//! middleware across the API) and one keyed by user id (chat
//! throughput, checked in the chat pipeline). Windows are short-term
//! abuse protection, not billing-accurate quotas; state resets with the
//! process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::RwLock;
use serde_json::json;
use tracing::debug;

use crate::metrics::Counter;
use crate::server::AppState;

/// How often expired windows are swept out of the map.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window limiter over string keys.
pub struct RateLimiter {
    entries: RwLock<HashMap<String, WindowEntry>>,
    window: Duration,
    sweep_interval: Duration,
    last_sweep: RwLock<Instant>,
    rejections: Counter,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            last_sweep: RwLock::new(Instant::now()),
            rejections: Counter::new(),
        }
    }

    /// Override the sweep cadence (tests and aggressive deployments).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Count one request against `key`. The first request of a window
    /// always passes; subsequent ones pass while the incremented count
    /// stays within `limit`.
    pub fn check(&self, key: &str, limit: u32) -> bool {
        self.maybe_sweep();
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if now <= entry.reset_at => {
                entry.count += 1;
                let allowed = entry.count <= limit;
                if !allowed {
                    self.rejections.inc();
                }
                allowed
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    WindowEntry {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }

    /// Drop expired windows once per sweep interval to bound memory.
    fn maybe_sweep(&self) {
        {
            let mut last_sweep = self.last_sweep.write();
            if last_sweep.elapsed() < self.sweep_interval {
                return;
            }
            *last_sweep = Instant::now();
        }
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, entry| now <= entry.reset_at);
        debug!(target: "gateway", remaining = entries.len(), "rate limiter sweep");
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.get()
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.read().len()
    }
}

/// Per-IP limiter applied to the whole HTTP surface.
pub async fn ip_rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let settings = &state.deps.config.rate_limit;
    let ip = addr.ip();
    if settings.exempt_loopback && ip.is_loopback() {
        return next.run(request).await;
    }
    if state.deps.ip_limiter.check(&ip.to_string(), settings.ip_limit) {
        next.run(request).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_limit_then_rejects() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4", 2));
        assert!(limiter.check("1.2.3.4", 2));
        assert!(!limiter.check("1.2.3.4", 2));
        assert!(!limiter.check("1.2.3.4", 2));
        assert_eq!(limiter.rejections(), 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("a", 1));
        assert!(!limiter.check("a", 1));
        assert!(limiter.check("b", 1));
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        assert!(limiter.check("u-1", 1));
        assert!(!limiter.check("u-1", 1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("u-1", 1));
    }

    #[test]
    fn test_sweep_drops_expired_entries() {
        let limiter =
            RateLimiter::new(Duration::from_millis(10)).with_sweep_interval(Duration::ZERO);
        limiter.check("a", 5);
        limiter.check("b", 5);
        assert_eq!(limiter.tracked_keys(), 2);
        std::thread::sleep(Duration::from_millis(20));
        limiter.check("c", 5);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_first_request_of_window_always_passes() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("z", 0));
        assert!(!limiter.check("z", 0));
    }
}
