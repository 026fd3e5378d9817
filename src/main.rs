//! pulsegate binary
//!
//! Composition root: loads config, constructs every collaborator once,
//! and injects them into the server as an explicit dependency bag. No
//! module-level singletons; tests build the same bag with fakes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use pulsegate::auth::{AuthenticatedUser, HttpTokenVerifier, StaticTokenVerifier, TokenVerifier};
use pulsegate::cache::CacheService;
use pulsegate::config::{self, Config};
use pulsegate::logging::{self, LogConfig};
use pulsegate::persistence::AuditLogPersistence;
use pulsegate::server::http::build_router;
use pulsegate::server::ratelimit::RateLimiter;
use pulsegate::server::{AppDeps, AppState};
use pulsegate::sessions::{SessionRegistry, SessionRegistryConfig};
use pulsegate::webhook::{HttpTransport, WebhookClient};

#[derive(Parser)]
#[command(name = "pulsegate", about = "Real-time chat gateway with cached trend digests")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server
    Start,
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        // No subcommand and explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,
        Some(Command::Version) => {
            println!("pulsegate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;
    let config = config::load_config()?;
    config::validate_config(&config)?;

    let registry = Arc::new(SessionRegistry::new(SessionRegistryConfig {
        sweep_interval: Duration::from_secs(config.sessions.sweep_interval_secs),
        session_timeout: Duration::from_secs(config.sessions.timeout_secs),
    }));
    registry.spawn_sweeper();

    let cache = Arc::new(CacheService::new(
        config.cache.ttl(),
        config.cache.max_entries,
    ));
    let transport = Arc::new(HttpTransport::new(config.webhook.timeout())?);
    let webhook = Arc::new(WebhookClient::new(
        config.webhook.clone(),
        transport,
        Some(cache.clone()),
    ));
    let verifier = build_verifier(&config)?;
    let persistence = Arc::new(AuditLogPersistence::new());
    let ip_limiter = Arc::new(RateLimiter::new(config.rate_limit.window()));
    let user_limiter = Arc::new(RateLimiter::new(config.rate_limit.window()));

    let addr: SocketAddr = config.bind.address.parse()?;
    let state = AppState::new(AppDeps {
        registry: registry.clone(),
        cache,
        webhook,
        verifier,
        persistence,
        ip_limiter,
        user_limiter,
        started_at: Instant::now(),
        config,
    });
    let router = build_router(state);

    info!(target: "gateway", %addr, version = env!("CARGO_PKG_VERSION"), "pulsegate listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry))
    .await?;

    info!(target: "gateway", "gateway shut down");
    Ok(())
}

fn build_verifier(config: &Config) -> Result<Arc<dyn TokenVerifier>, Box<dyn std::error::Error>> {
    if let Some(url) = &config.auth.verify_url {
        return Ok(Arc::new(HttpTokenVerifier::new(url.clone())));
    }
    if let Some(token) = &config.auth.static_token {
        return Ok(Arc::new(StaticTokenVerifier::new(
            token.clone(),
            AuthenticatedUser {
                user_id: "operator".to_string(),
                email: "operator@localhost".to_string(),
            },
        )));
    }
    Err("no token verifier configured".into())
}

/// Wait for SIGINT, then close every live session before the listener
/// stops accepting.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target: "gateway", error = %err, "failed to listen for shutdown signal");
    }
    info!(target: "gateway", "shutdown signal received");
    registry.shutdown();
}

/// PULSEGATE_DEV switches to plaintext debug logging.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let dev = std::env::var("PULSEGATE_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false);
    let log_config = if dev {
        LogConfig::development()
    } else {
        LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}
