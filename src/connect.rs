//! CONNECT tunnel establishment through an HTTP proxy.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::target::{ConnectOptions, ProxyTarget};

use http::header::HOST;
use http::HeaderMap;
use log::{debug, trace};
use std::fmt;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Upper bound on the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8192;

/// The ultimate destination a tunnel should reach, as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&ConnectOptions> for Destination {
    fn from(options: &ConnectOptions) -> Self {
        Destination {
            host: options.host.clone(),
            port: options.port,
        }
    }
}

/// Establish a tunnel to `dest` through `target`, bounded by
/// `config.connect_timeout`.
///
/// On a 200 response the tunneled socket is returned and all further error
/// handling belongs to the caller. On any other status the socket is still
/// surfaced, carried inside [`TunnelError::TunnelRejected`]. If the proxy
/// never answers in time the attempt is aborted and the connection dropped.
pub async fn establish(
    dest: &Destination,
    target: &ProxyTarget,
    headers: &HeaderMap,
    config: &TunnelConfig,
) -> Result<TcpStream, TunnelError> {
    match timeout(config.connect_timeout, handshake(dest, target, headers)).await {
        Ok(result) => result,
        // Dropping the handshake future tears down the proxy connection.
        Err(_) => {
            debug!("CONNECT to {} via {} timed out", dest, target.host);
            Err(TunnelError::TunnelTimeout)
        }
    }
}

async fn handshake(
    dest: &Destination,
    target: &ProxyTarget,
    headers: &HeaderMap,
) -> Result<TcpStream, TunnelError> {
    let mut stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    trace!("connected to proxy {}:{}", target.host, target.port);

    let request = build_connect_request(dest, target, headers);
    stream.write_all(&request).await?;

    let mut buf = [0u8; MAX_RESPONSE_HEAD];
    let mut pos = 0;
    loop {
        let n = stream.read(&mut buf[pos..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed connection during CONNECT handshake",
            )
            .into());
        }
        pos += n;
        if buf[..pos].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if pos == buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy response head too long",
            )
            .into());
        }
    }

    let status = parse_status(&buf[..pos])?;
    if status == 200 {
        debug!("tunnel to {} established via {}", dest, target.host);
        Ok(stream)
    } else {
        debug!("tunnel to {} rejected with status {}", dest, status);
        Err(TunnelError::TunnelRejected {
            status,
            stream: Some(Box::new(stream)),
        })
    }
}

/// Render the CONNECT request head. Caller headers are forwarded, `Host` is
/// always the destination, and a configured credential becomes a Basic
/// `Proxy-Authorization` header.
fn build_connect_request(dest: &Destination, target: &ProxyTarget, headers: &HeaderMap) -> Vec<u8> {
    let mut buf = format!("CONNECT {} HTTP/1.1\r\n", dest).into_bytes();
    for (name, value) in headers {
        if name == HOST {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("Host: {}\r\n", dest).as_bytes());
    if let Some(credential) = &target.credential {
        buf.extend_from_slice(
            format!("Proxy-Authorization: Basic {}\r\n", credential.to_basic()).as_bytes(),
        );
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

fn parse_status(head: &[u8]) -> Result<u16, TunnelError> {
    let line = head
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let line = String::from_utf8_lossy(line);
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed proxy status line {:?}", line),
            )
        })?;
    Ok(status)
}

/// One in-flight CONNECT handshake started with [`connect`].
///
/// Resolves exactly once; aborting cancels the timeout and releases the
/// underlying proxy connection. A second `abort` is a no-op.
#[derive(Debug)]
pub struct PendingConnect {
    outcome: oneshot::Receiver<Result<(), TunnelError>>,
    task: JoinHandle<()>,
    aborted: bool,
}

impl PendingConnect {
    /// Cancel the attempt. Drops the timeout and the proxy connection;
    /// calling this twice has no further effect.
    pub fn abort(&mut self) {
        if !self.aborted {
            self.aborted = true;
            self.task.abort();
        }
    }

    /// Whether [`PendingConnect::abort`] has been called.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Wait for the handshake outcome. The socket itself is delivered to the
    /// `on_connected` callback before any failure is reported here.
    pub async fn outcome(self) -> Result<(), TunnelError> {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::Interrupted, "connect aborted").into()),
        }
    }
}

/// Start a one-shot tunnel without pooling.
///
/// Parse failures are reported synchronously. Once the proxy responds the
/// socket is handed to `on_connected` even on a non-200 status, and only
/// afterwards does the returned handle resolve with the rejection, so a
/// caller that has already attached itself to the socket still observes the
/// failure.
pub fn connect<F>(
    options: &ConnectOptions,
    config: TunnelConfig,
    on_connected: F,
) -> Result<PendingConnect, TunnelError>
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let target = ProxyTarget::from_options(options)?;
    let dest = Destination::from(options);
    let headers = options.headers.clone();

    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let result = match timeout(
            config.connect_timeout,
            handshake(&dest, &target, &headers),
        )
        .await
        {
            Ok(Ok(stream)) => {
                on_connected(stream);
                Ok(())
            }
            Ok(Err(TunnelError::TunnelRejected {
                status,
                stream: Some(stream),
            })) => {
                // Deliver the socket first, then report the rejection.
                on_connected(*stream);
                Err(TunnelError::TunnelRejected {
                    status,
                    stream: None,
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TunnelError::TunnelTimeout),
        };
        let _ = tx.send(result);
    });

    Ok(PendingConnect {
        outcome: rx,
        task,
        aborted: false,
    })
}
