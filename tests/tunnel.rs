//! Integration tests against a mock CONNECT proxy.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tunnel_agent::{
    Agent, AgentKind, ConnectOptions, Destination, ProxyTarget, TunnelConfig, TunnelError,
};

/// A proxy that answers every CONNECT with a fixed response (or stays
/// silent) and keeps the accepted sockets open until closed.
struct MockProxy {
    addr: SocketAddr,
    heads: mpsc::UnboundedReceiver<String>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockProxy {
    async fn start(response: Option<&str>) -> MockProxy {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = response.map(str::to_owned);
        let (head_tx, heads) = mpsc::unbounded_channel();
        let (stop, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        let mut buf = vec![0u8; 8192];
                        let mut pos = 0;
                        loop {
                            match stream.read(&mut buf[pos..]).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => pos += n,
                            }
                            if buf[..pos].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        if pos > 0 {
                            let _ = head_tx.send(String::from_utf8_lossy(&buf[..pos]).into_owned());
                        }
                        if let Some(response) = &response {
                            let _ = stream.write_all(response.as_bytes()).await;
                        }
                        held.push(stream);
                    }
                }
            }
            // Dropping `held` closes every accepted socket.
        });

        MockProxy {
            addr,
            heads,
            stop: Some(stop),
            task,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Close every accepted socket and stop accepting.
    async fn close(mut self) {
        self.stop.take();
        let _ = self.task.await;
    }
}

const ESTABLISHED: &str = "HTTP/1.1 200 Connection Established\r\n\r\n";
const AUTH_REQUIRED: &str = "HTTP/1.1 407 Proxy Authentication Required\r\n\r\n";

fn test_config() -> TunnelConfig {
    TunnelConfig::builder()
        .reaper_interval(Duration::from_secs(1))
        .build()
}

fn test_agent(proxy: &MockProxy) -> Agent {
    let target = ProxyTarget::parse(&proxy.url()).unwrap();
    Agent::new(
        AgentKind::HttpsOverHttp,
        target,
        http::HeaderMap::new(),
        test_config(),
        None,
    )
}

fn dest() -> Destination {
    Destination {
        host: "example.com".to_string(),
        port: 443,
    }
}

#[tokio::test]
async fn tunnel_established_on_200() {
    let mut proxy = MockProxy::start(Some(ESTABLISHED)).await;
    let agent = test_agent(&proxy);

    let mut socket = agent.obtain(&dest()).await.unwrap();
    socket.write_all(b"ping").await.unwrap();

    let head = proxy.heads.recv().await.unwrap();
    assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    assert!(head.contains("Host: example.com:443\r\n"));

    let stats = agent.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 0);
}

#[tokio::test]
async fn credential_is_sent_as_basic_auth() {
    let mut proxy = MockProxy::start(Some(ESTABLISHED)).await;
    let target = ProxyTarget::parse(&format!("http://user:pass@{}", proxy.addr)).unwrap();
    let agent = Agent::new(
        AgentKind::HttpsOverHttp,
        target,
        http::HeaderMap::new(),
        test_config(),
        None,
    );

    agent.obtain(&dest()).await.unwrap();

    let head = proxy.heads.recv().await.unwrap();
    assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

#[tokio::test]
async fn rejection_still_delivers_the_socket() {
    let proxy = MockProxy::start(Some(AUTH_REQUIRED)).await;
    let agent = test_agent(&proxy);

    let err = agent.obtain(&dest()).await.unwrap_err();
    match err {
        TunnelError::TunnelRejected { status, stream } => {
            assert_eq!(status, 407);
            assert!(stream.is_some());
        }
        other => panic!("expected rejection, got {other}"),
    }
}

#[tokio::test]
async fn rejection_reports_after_socket_delivery() {
    let proxy = MockProxy::start(Some(AUTH_REQUIRED)).await;
    let options = ConnectOptions::new("example.com", 443, proxy.url());

    let delivered: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&delivered);
    let pending = tunnel_agent::connect(&options, move |socket| {
        *slot.lock().unwrap() = Some(socket);
    })
    .unwrap();

    let err = pending.outcome().await.unwrap_err();
    assert_eq!(err.rejection_status(), Some(407));
    // The socket was handed over before the failure resolved.
    assert!(delivered.lock().unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn silent_proxy_times_out() {
    let proxy = MockProxy::start(None).await;
    let options = ConnectOptions::new("example.com", 443, proxy.url());

    let start = Instant::now();
    let pending = tunnel_agent::connect(&options, |_socket| {
        panic!("socket delivered despite a silent proxy");
    })
    .unwrap();

    let mut outcome = tokio_test::task::spawn(pending.outcome());
    tokio_test::assert_pending!(outcome.poll());

    let err = outcome.await.unwrap_err();
    assert!(matches!(err, TunnelError::TunnelTimeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(16), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(17), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn invalid_proxy_url_fails_before_connecting() {
    let options = ConnectOptions::new("example.com", 443, "");
    let err = tunnel_agent::connect(&options, |_socket| {}).unwrap_err();
    assert!(matches!(err, TunnelError::InvalidProxyConfig(_)));
}

#[tokio::test]
async fn double_abort_is_a_noop() {
    let proxy = MockProxy::start(None).await;
    let options = ConnectOptions::new("example.com", 443, proxy.url());

    let mut pending = tunnel_agent::connect(&options, |_socket| {}).unwrap();
    pending.abort();
    pending.abort();
    assert!(pending.is_aborted());
    assert!(pending.outcome().await.is_err());
}

#[tokio::test]
async fn released_socket_is_reused() {
    let mut proxy = MockProxy::start(Some(ESTABLISHED)).await;
    let agent = test_agent(&proxy);

    let socket = agent.obtain(&dest()).await.unwrap();
    agent.release(&dest(), socket);
    assert_eq!(agent.stats().idle, 1);

    let _socket = agent.obtain(&dest()).await.unwrap();
    let stats = agent.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.idle, 0);

    // Only one CONNECT ever reached the proxy.
    assert!(proxy.heads.recv().await.is_some());
    assert!(proxy.heads.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn idle_socket_is_evicted_without_external_action() {
    let proxy = MockProxy::start(Some(ESTABLISHED)).await;
    let agent = test_agent(&proxy);

    let socket = agent.obtain(&dest()).await.unwrap();
    agent.release(&dest(), socket);

    tokio::time::sleep(Duration::from_secs(61)).await;

    let stats = agent.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.evicted_idle, 1);
    assert_eq!(stats.evicted_fault, 0);
}

#[tokio::test(start_paused = true)]
async fn fault_on_free_socket_is_contained() {
    let proxy = MockProxy::start(Some(ESTABLISHED)).await;
    let agent = test_agent(&proxy);

    let socket = agent.obtain(&dest()).await.unwrap();
    agent.release(&dest(), socket);

    // Kill the proxy side while the socket sits free in the pool.
    proxy.close().await;

    let mut evicted = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        evicted = agent.stats().evicted_fault;
        if evicted > 0 {
            break;
        }
    }
    assert_eq!(evicted, 1);
    assert_eq!(agent.stats().idle, 0);

    // Further reaper passes must not count the removal again.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(agent.stats().evicted_fault, 1);
}
