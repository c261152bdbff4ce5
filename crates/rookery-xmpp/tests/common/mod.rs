//! Test utilities: an ephemeral-port endpoint and a raw-socket XMPP client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use rookery_xmpp::auth::InMemoryAuthBackend;
use rookery_xmpp::{Server, ServerConfig};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Window used when asserting that nothing arrives.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(300);

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// A running endpoint on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<Server<InMemoryAuthBackend>>,
    pub auth: Arc<InMemoryAuthBackend>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a server on `localhost` with the standard test accounts.
    pub async fn start() -> Self {
        let auth = Arc::new(InMemoryAuthBackend::new());
        auth.add_user("test", "localhost", "secret");
        auth.add_user("alice", "localhost", "secret");
        auth.add_user("bob", "localhost", "secret");
        Self::start_with(auth).await
    }

    /// Start a server with a custom credential store.
    pub async fn start_with(auth: Arc<InMemoryAuthBackend>) -> Self {
        init_tracing();

        let config = ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            hosts: vec!["localhost".to_string()],
            ..ServerConfig::default()
        };
        let server =
            Arc::new(Server::new(config, Arc::clone(&auth), None).expect("server assembly"));
        let listener = server.bind().expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");

        let shutdown = CancellationToken::new();
        {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = server.run(listener, shutdown).await;
            });
        }

        Self {
            addr,
            server,
            auth,
            shutdown,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A raw XMPP client speaking bytes over TCP.
pub struct RawClient {
    stream: TcpStream,
    pending: String,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(DEFAULT_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timeout")
            .expect("connect");
        Self {
            stream,
            pending: String::new(),
        }
    }

    pub async fn send(&mut self, data: &str) {
        timeout(DEFAULT_TIMEOUT, self.stream.write_all(data.as_bytes()))
            .await
            .expect("send timeout")
            .expect("send");
    }

    /// Read until the transcript contains `pattern`; returns and consumes
    /// everything up to and including it.
    pub async fn recv_until(&mut self, pattern: &str) -> String {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        loop {
            if let Some(pos) = self.pending.find(pattern) {
                let end = pos + pattern.len();
                return self.pending.drain(..end).collect();
            }
            let now = Instant::now();
            assert!(
                now < deadline,
                "timed out waiting for {:?}; buffered: {:?}",
                pattern,
                self.pending
            );
            let mut chunk = [0u8; 4096];
            let n = timeout(deadline - now, self.stream.read(&mut chunk))
                .await
                .unwrap_or_else(|_| {
                    panic!(
                        "timed out waiting for {:?}; buffered: {:?}",
                        pattern, self.pending
                    )
                })
                .expect("read");
            assert!(
                n > 0,
                "connection closed while waiting for {:?}; buffered: {:?}",
                pattern,
                self.pending
            );
            self.pending
                .push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    }

    /// Assert that `needle` does not arrive within the silence window.
    pub async fn assert_silent_of(&mut self, needle: &str) {
        let deadline = Instant::now() + SILENCE_WINDOW;
        loop {
            assert!(
                !self.pending.contains(needle),
                "unexpected {:?} in transcript: {:?}",
                needle,
                self.pending
            );
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let mut chunk = [0u8; 4096];
            match timeout(deadline - now, self.stream.read(&mut chunk)).await {
                Err(_) => return,
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => self
                    .pending
                    .push_str(&String::from_utf8_lossy(&chunk[..n])),
                Ok(Err(e)) => panic!("read failed: {}", e),
            }
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_close(&mut self) {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let now = Instant::now();
            assert!(now < deadline, "server did not close the connection");
            let mut chunk = [0u8; 4096];
            match timeout(deadline - now, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => self
                    .pending
                    .push_str(&String::from_utf8_lossy(&chunk[..n])),
                Ok(Err(_)) => return,
                Err(_) => panic!("server did not close the connection"),
            }
        }
    }

    /// Open a 1.0 stream to `localhost` and consume the server header.
    pub async fn open_stream(&mut self) -> String {
        self.send(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='localhost' version='1.0'>",
        )
        .await;
        self.recv_until("<stream:stream").await;
        self.recv_until(">").await
    }
}

/// Base64 of the SASL PLAIN `authzid NUL user NUL password` message.
pub fn plain_credentials(user: &str, password: &str) -> String {
    BASE64_STANDARD.encode(format!("\0{}\0{}", user, password))
}

/// Drive a connection through SASL PLAIN, stream restart, bind and session.
pub async fn establish(addr: SocketAddr, user: &str, password: &str, resource: &str) -> RawClient {
    let mut client = RawClient::connect(addr).await;
    client.open_stream().await;
    client.recv_until("</stream:features>").await;

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            plain_credentials(user, password)
        ))
        .await;
    client.recv_until("<success").await;

    client.open_stream().await;
    client.recv_until("</stream:features>").await;

    client
        .send(&format!(
            "<iq type='set' id='bind1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{}</resource></bind></iq>",
            resource
        ))
        .await;
    client
        .recv_until(&format!("{}@localhost/{}</jid>", user, resource))
        .await;

    client
        .send(
            "<iq type='set' id='sess1'>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        )
        .await;
    client.recv_until("id='sess1'").await;
    client.recv_until(">").await;

    client
}

/// Send initial presence with a priority and wait until the session has
/// observed it (its own presence comes back through the broadcast).
pub async fn announce_presence(client: &mut RawClient, user: &str, resource: &str, priority: i32) {
    client
        .send(&format!(
            "<presence><priority>{}</priority></presence>",
            priority
        ))
        .await;
    client
        .recv_until(&format!("from='{}@localhost/{}'", user, resource))
        .await;
}
