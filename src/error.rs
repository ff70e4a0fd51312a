//! Error types for the tunnel-agent crate.

use thiserror::Error;
use tokio::net::TcpStream;

/// Errors reported while parsing a proxy target or establishing a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The proxy target is missing or cannot be parsed into host/port.
    /// Reported synchronously, before any connection is attempted.
    #[error("invalid proxy configuration: {0}")]
    InvalidProxyConfig(String),

    /// The proxy did not answer the CONNECT request within the configured
    /// timeout. The underlying connection has been dropped.
    #[error("tunnel handshake timed out")]
    TunnelTimeout,

    /// The proxy answered the CONNECT request with a non-200 status. The
    /// socket is carried inside the error so the caller can still drain or
    /// inspect the proxy's response; it is `None` when the socket was
    /// already handed out through a connect callback.
    #[error("tunneling socket could not be established, status={status}")]
    TunnelRejected {
        status: u16,
        stream: Option<Box<TcpStream>>,
    },

    /// Transport failure before a tunnel existed.
    #[error("tunnel transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Status code of a rejected handshake, if that is what this error is.
    pub fn rejection_status(&self) -> Option<u16> {
        match self {
            TunnelError::TunnelRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
