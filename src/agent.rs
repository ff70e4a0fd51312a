//! Pooling agent for tunneled connections.
//!
//! An [`Agent`] owns the tunnel sockets established through one proxy and
//! reuses them across requests. Every free socket is watched by a reaper
//! task that destroys it after the idle window and contains any fault on it
//! so that a broken pooled socket can never take the process down.

use crate::config::TunnelConfig;
use crate::connect::{self, Destination};
use crate::error::TunnelError;
use crate::target::ProxyTarget;

use http::HeaderMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What an agent tunnels through the proxy. Both kinds share the same
/// pooling logic; the kind feeds the cache key and tells the TLS layer
/// above whether the tunneled stream still needs a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Plain HTTP carried over the proxy tunnel.
    HttpOverHttp,
    /// TLS carried over the proxy tunnel.
    HttpsOverHttp,
}

impl AgentKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AgentKind::HttpOverHttp => "http-over-http",
            AgentKind::HttpsOverHttp => "https-over-http",
        }
    }
}

/// Post-processing hook applied to every socket the agent produces, before
/// it is handed to the caller.
pub type SocketHook = Arc<dyn Fn(&TcpStream) + Send + Sync>;

/// Lifecycle of one pooled socket. A single transition function makes
/// re-entrant destroys safe: `Destroyed` is terminal and entering it a
/// second time reports `false`, so removal is accounted exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Checked out, owned by an in-flight request.
    Active,
    /// Sitting in the pool, unowned.
    Free,
    /// Torn down; terminal.
    Destroyed,
}

impl SocketState {
    /// Attempt a transition, reporting whether it took effect.
    pub fn transition(&mut self, to: SocketState) -> bool {
        if *self == SocketState::Destroyed || *self == to {
            return false;
        }
        *self = to;
        true
    }
}

/// Why a free socket was removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalReason {
    IdleTimeout,
    Fault,
}

struct IdleSocket {
    stream: TcpStream,
    state: SocketState,
    pooled_at: Instant,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted_idle: AtomicU64,
    evicted_fault: AtomicU64,
}

/// Snapshot of an agent's pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStats {
    /// Free sockets currently pooled.
    pub idle: usize,
    /// Tunnels established by this agent.
    pub created: u64,
    /// Checkouts served from the pool.
    pub reused: u64,
    /// Free sockets destroyed after the idle window.
    pub evicted_idle: u64,
    /// Free sockets destroyed after a contained fault.
    pub evicted_fault: u64,
}

struct Shared {
    // Free sockets per destination `host:port`.
    pool: Mutex<HashMap<String, Vec<IdleSocket>>>,
    counters: Counters,
    config: TunnelConfig,
}

impl Shared {
    fn evict(&self, dest: &str, socket: &mut IdleSocket, reason: RemovalReason) {
        if !socket.state.transition(SocketState::Destroyed) {
            return;
        }
        match reason {
            RemovalReason::IdleTimeout => {
                self.counters.evicted_idle.fetch_add(1, Ordering::Relaxed);
                debug!("destroying idle tunnel socket for {}", dest);
            }
            RemovalReason::Fault => {
                self.counters.evicted_fault.fetch_add(1, Ordering::Relaxed);
                warn!("destroying faulted free tunnel socket for {}", dest);
            }
        }
    }

    /// One reaper pass: destroy free sockets past the idle window and any
    /// whose peer side has failed or closed. Faults are contained here,
    /// they never propagate to a caller.
    fn scan(&self) {
        let idle_timeout = self.config.idle_timeout;
        let mut pool = self.pool.lock();
        for (dest, sockets) in pool.iter_mut() {
            sockets.retain_mut(|socket| {
                if socket.pooled_at.elapsed() >= idle_timeout {
                    self.evict(dest, socket, RemovalReason::IdleTimeout);
                    return false;
                }
                match probe(&socket.stream) {
                    Ok(()) => true,
                    Err(err) => {
                        trace!("free socket for {} faulted: {}", dest, err);
                        self.evict(dest, socket, RemovalReason::Fault);
                        false
                    }
                }
            });
        }
        pool.retain(|_, sockets| !sockets.is_empty());
    }
}

/// Non-blocking health probe on a free socket. A free socket has no reader,
/// so readable data, EOF, or an error all mean it cannot be reused.
fn probe(stream: &TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 32];
    match stream.try_read(&mut buf) {
        Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsolicited data on free socket",
        )),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(err) => Err(err),
    }
}

/// Long-lived pooling object for one proxy target.
///
/// Created by [`AgentCache`](crate::cache::AgentCache) on the first request
/// for a given proxy and kept for the life of the process.
pub struct Agent {
    kind: AgentKind,
    target: ProxyTarget,
    headers: HeaderMap,
    hook: Option<SocketHook>,
    shared: Arc<Shared>,
    reaper: JoinHandle<()>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Build an agent for `target` and start its reaper task. Must be
    /// called from within a Tokio runtime.
    pub fn new(
        kind: AgentKind,
        target: ProxyTarget,
        headers: HeaderMap,
        config: TunnelConfig,
        hook: Option<SocketHook>,
    ) -> Self {
        let shared = Arc::new(Shared {
            pool: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            config,
        });
        let reaper = spawn_reaper(&shared);
        Self {
            kind,
            target,
            headers,
            hook,
            shared,
            reaper,
        }
    }

    /// What this agent tunnels.
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// The proxy this agent tunnels through.
    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Whether certificate validation is skipped on the proxy hop. Consumed
    /// by the TLS layer above this crate.
    pub fn accept_invalid_proxy_certs(&self) -> bool {
        self.shared.config.accept_invalid_proxy_certs
    }

    /// Get a tunnel socket to `dest`: a pooled one when a live free socket
    /// exists, otherwise a freshly established tunnel.
    pub async fn obtain(&self, dest: &Destination) -> Result<TcpStream, TunnelError> {
        if let Some(stream) = self.checkout(dest) {
            self.shared.counters.reused.fetch_add(1, Ordering::Relaxed);
            trace!("reusing pooled tunnel socket for {}", dest);
            return Ok(stream);
        }

        let stream =
            connect::establish(dest, &self.target, &self.headers, &self.shared.config).await?;
        if let Some(hook) = &self.hook {
            hook(&stream);
        }
        self.shared.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    /// Return a socket to the free pool. When the pool for that destination
    /// is full the socket is simply dropped.
    pub fn release(&self, dest: &Destination, stream: TcpStream) {
        let mut pool = self.shared.pool.lock();
        let sockets = pool.entry(dest.to_string()).or_default();
        if sockets.len() >= self.shared.config.max_idle {
            trace!("pool full for {}, dropping tunnel socket", dest);
            return;
        }
        let mut state = SocketState::Active;
        state.transition(SocketState::Free);
        sockets.push(IdleSocket {
            stream,
            state,
            pooled_at: Instant::now(),
        });
    }

    fn checkout(&self, dest: &Destination) -> Option<TcpStream> {
        let mut pool = self.shared.pool.lock();
        let sockets = pool.get_mut(&dest.to_string())?;
        while let Some(mut socket) = sockets.pop() {
            if socket.pooled_at.elapsed() >= self.shared.config.idle_timeout {
                self.shared
                    .evict(&dest.to_string(), &mut socket, RemovalReason::IdleTimeout);
                continue;
            }
            if socket.state.transition(SocketState::Active) {
                return Some(socket.stream);
            }
        }
        None
    }

    /// Snapshot of pool activity.
    pub fn stats(&self) -> AgentStats {
        let idle = self.shared.pool.lock().values().map(Vec::len).sum();
        AgentStats {
            idle,
            created: self.shared.counters.created.load(Ordering::Relaxed),
            reused: self.shared.counters.reused.load(Ordering::Relaxed),
            evicted_idle: self.shared.counters.evicted_idle.load(Ordering::Relaxed),
            evicted_fault: self.shared.counters.evicted_fault.load(Ordering::Relaxed),
        }
    }

    /// Stop the reaper and drop all free sockets.
    pub fn shutdown(&self) {
        self.reaper.abort();
        self.shared.pool.lock().clear();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

fn spawn_reaper(shared: &Arc<Shared>) -> JoinHandle<()> {
    let interval = shared.config.reaper_interval;
    let weak: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match weak.upgrade() {
                Some(shared) => shared.scan(),
                None => break,
            }
        }
    })
}
