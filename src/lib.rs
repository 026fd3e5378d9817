//! pulsegate gateway library
//!
//! Real-time delivery backbone between browser WebSocket clients and an
//! external workflow webhook: session registry, stale-while-revalidate
//! response cache, resilient webhook invocation, and the WebSocket
//! protocol layer that normalizes upstream payloads and fans messages
//! out to live connections.

pub mod auth;
pub mod cache;
pub mod config;
pub mod logging;
pub mod messages;
pub mod metrics;
pub mod persistence;
pub mod server;
pub mod sessions;
pub mod webhook;
