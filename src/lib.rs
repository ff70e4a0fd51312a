//! # tunnel-agent
//!
//! Pooled HTTP CONNECT tunnel agents.
//!
//! This library lets an HTTP or HTTPS client reach its destination through
//! an intermediate HTTP proxy: it parses proxy targets, establishes CONNECT
//! tunnels with a handshake timeout, caches one pooling agent per distinct
//! proxy, evicts idle tunnel sockets, and contains faults on pooled sockets
//! so they never crash the process. It does not implement the HTTP client
//! or TLS itself; it only produces ready-to-use tunneled sockets.

pub mod agent;
pub mod cache;
pub mod config;
pub mod connect;
pub mod error;
pub mod target;

pub use agent::{Agent, AgentKind, AgentStats, SocketHook, SocketState};
pub use cache::{AgentCache, AgentKey};
pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use connect::{Destination, PendingConnect};
pub use error::TunnelError;
pub use target::{ConnectOptions, Credential, ProxyTarget};

use std::sync::Arc;
use tokio::net::TcpStream;

/// Agent for plain HTTP through the proxy in `options`, from the
/// process-wide cache.
pub fn http_agent(options: &ConnectOptions) -> Result<Arc<Agent>, TunnelError> {
    AgentCache::global().get_agent(options, AgentKind::HttpOverHttp)
}

/// Agent for TLS through the proxy in `options`, from the process-wide
/// cache.
pub fn https_agent(options: &ConnectOptions) -> Result<Arc<Agent>, TunnelError> {
    AgentCache::global().get_agent(options, AgentKind::HttpsOverHttp)
}

/// One-shot tunnel without pooling: hands the raw socket to `on_connected`
/// once the proxy responds and returns a handle that resolves with the
/// handshake outcome and supports aborting the attempt.
pub fn connect<F>(options: &ConnectOptions, on_connected: F) -> Result<PendingConnect, TunnelError>
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    connect::connect(options, TunnelConfig::default(), on_connected)
}
