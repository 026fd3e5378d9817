//! HTTP/WebSocket server
//!
//! The dependency bag wiring every collaborator into the request
//! handlers. Built once by the composition root; tests substitute fakes
//! for any seam.

pub mod http;
pub mod ratelimit;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::auth::TokenVerifier;
use crate::cache::CacheService;
use crate::config::Config;
use crate::persistence::Persistence;
use crate::server::ratelimit::RateLimiter;
use crate::sessions::SessionRegistry;
use crate::webhook::WebhookClient;

/// Everything the gateway's handlers depend on.
pub struct AppDeps {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub cache: Arc<CacheService<Value>>,
    pub webhook: Arc<WebhookClient>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub persistence: Arc<dyn Persistence>,
    pub ip_limiter: Arc<RateLimiter>,
    pub user_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

/// Shared axum state.
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<AppDeps>,
}

impl AppState {
    pub fn new(deps: AppDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }
}
