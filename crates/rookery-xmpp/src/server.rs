//! Server assembly: configuration, listener and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthBackend;
use crate::c2s::{self, C2sDeps};
use crate::jid::nameprep;
use crate::local::LocalHandler;
use crate::router::Router;
use crate::sasl::SaslRegistry;
use crate::session::{OfflineHandler, SessionManager};
use crate::socket::SocketConfig;
use crate::xml::Element;
use crate::XmppError;

/// Listen backlog for the C2S port.
const LISTEN_BACKLOG: u32 = 1024;

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind for C2S connections (default: 0.0.0.0:5222)
    pub listen_addr: SocketAddr,
    /// Domains served locally; canonicalised at startup
    pub hosts: Vec<String>,
    /// FQDN validated against DIGEST-MD5 `digest-uri`; defaults to the
    /// host the stream was opened against
    pub fqdn: Option<String>,
    /// Stream language when the client does not announce one
    pub default_lang: String,
    /// Cap on concurrent sessions per account
    pub max_user_sessions: usize,
    /// Per-connection socket tuning
    pub socket: SocketConfig,
    /// Negotiation hooks: extra elements appended to the pre-authentication
    /// stream features (TLS/compression advertisements live here)
    pub extra_stream_features: Vec<Element>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            hosts: vec!["localhost".to_string()],
            fqdn: None,
            default_lang: "en".to_string(),
            max_user_sessions: 10,
            socket: SocketConfig::default(),
            extra_stream_features: Vec::new(),
        }
    }
}

/// The C2S endpoint: routing fabric, session manager, SASL registry, local
/// handlers for every served host, and the accept loop.
pub struct Server<A: AuthBackend> {
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    sm: Arc<SessionManager<A>>,
    local: Arc<LocalHandler<A>>,
    sasl: Arc<SaslRegistry>,
    auth: Arc<A>,
}

impl<A: AuthBackend> Server<A> {
    /// Assemble the endpoint. Hosts are canonicalised; each one gets a local
    /// route.
    pub fn new(
        mut config: ServerConfig,
        auth: Arc<A>,
        offline: Option<OfflineHandler>,
    ) -> Result<Self, XmppError> {
        if config.hosts.is_empty() {
            return Err(XmppError::config("at least one served host is required"));
        }
        let mut hosts = Vec::with_capacity(config.hosts.len());
        for host in &config.hosts {
            let canonical = nameprep(host)?;
            if canonical.is_empty() {
                return Err(XmppError::config(format!("invalid host: {:?}", host)));
            }
            hosts.push(canonical);
        }
        config.hosts = hosts;

        let config = Arc::new(config);
        let router = Arc::new(Router::new());
        let sm = Arc::new(SessionManager::new(
            Arc::clone(&router),
            Arc::clone(&auth),
            offline,
            config.max_user_sessions,
        ));
        let local = LocalHandler::new(Arc::clone(&router), Arc::clone(&sm));
        for host in &config.hosts {
            LocalHandler::register_host(&local, host);
        }

        info!(hosts = ?config.hosts, "endpoint assembled");

        Ok(Self {
            config,
            router,
            sm,
            local,
            sasl: Arc::new(SaslRegistry::new()),
            auth,
        })
    }

    /// The endpoint configuration (hosts canonicalised).
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// The routing table.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager<A>> {
        &self.sm
    }

    /// The local handler (IQ handler registration).
    pub fn local_handler(&self) -> &Arc<LocalHandler<A>> {
        &self.local
    }

    /// Bind the C2S listener with `SO_REUSEADDR` and a 1024 backlog.
    pub fn bind(&self) -> Result<TcpListener, XmppError> {
        let socket = match self.config.listen_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.config.listen_addr)?;
        Ok(socket.listen(LISTEN_BACKLOG)?)
    }

    /// Accept connections until the shutdown token fires. Each accepted
    /// socket becomes one connection process.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        let addr = listener.local_addr()?;
        info!(%addr, "C2S listener started");

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        self.accept(stream, peer);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("accept loop stopped");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Spawn the connection process for one accepted socket.
    pub fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        c2s::start(stream, peer, self.c2s_deps());
    }

    fn c2s_deps(&self) -> C2sDeps<A> {
        C2sDeps {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            sm: Arc::clone(&self.sm),
            sasl: Arc::clone(&self.sasl),
            auth: Arc::clone(&self.auth),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryAuthBackend;

    #[tokio::test]
    async fn hosts_are_canonicalised() {
        let config = ServerConfig {
            hosts: vec!["Example.Net".to_string()],
            ..ServerConfig::default()
        };
        let server =
            Server::new(config, Arc::new(InMemoryAuthBackend::new()), None).unwrap();
        assert_eq!(server.config().hosts, vec!["example.net".to_string()]);
        assert!(server.router().has_route("example.net"));
    }

    #[tokio::test]
    async fn empty_host_list_is_rejected() {
        let config = ServerConfig {
            hosts: Vec::new(),
            ..ServerConfig::default()
        };
        assert!(Server::new(config, Arc::new(InMemoryAuthBackend::new()), None).is_err());
    }

    #[tokio::test]
    async fn bind_uses_an_ephemeral_port_in_tests() {
        let config = ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        };
        let server =
            Server::new(config, Arc::new(InMemoryAuthBackend::new()), None).unwrap();
        let listener = server.bind().unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
