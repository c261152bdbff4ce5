use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rookery_xmpp::auth::InMemoryAuthBackend;
use rookery_xmpp::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("rookeryd starting");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    let config = config_from_env()?;
    let auth = auth_from_env();
    let server = Server::new(config, auth, None)?;
    let listener = server.bind()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            shutdown.cancel();
        });
    }

    server.run(listener, shutdown).await?;
    Ok(())
}

/// Build the endpoint configuration from the environment.
///
/// `ROOKERY_LISTEN` (default `0.0.0.0:5222`) and `ROOKERY_HOSTS` (comma
/// separated, default `localhost`).
fn config_from_env() -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Ok(listen) = std::env::var("ROOKERY_LISTEN") {
        config.listen_addr = listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid ROOKERY_LISTEN: {:?}", listen))?;
    }
    if let Ok(hosts) = std::env::var("ROOKERY_HOSTS") {
        config.hosts = hosts
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
    }
    if let Ok(fqdn) = std::env::var("ROOKERY_FQDN") {
        config.fqdn = Some(fqdn);
    }

    Ok(config)
}

/// Seed the in-memory credential store from `ROOKERY_USERS`, a
/// comma-separated list of `user:password` pairs on the first served host.
fn auth_from_env() -> Arc<InMemoryAuthBackend> {
    let auth = InMemoryAuthBackend::new();
    let hosts = std::env::var("ROOKERY_HOSTS").unwrap_or_else(|_| "localhost".to_string());
    let host = hosts.split(',').next().unwrap_or("localhost").trim();

    if let Ok(users) = std::env::var("ROOKERY_USERS") {
        for pair in users.split(',') {
            if let Some((user, password)) = pair.trim().split_once(':') {
                auth.add_user(user, host, password);
                info!(user, host, "registered account");
            }
        }
    }

    Arc::new(auth)
}
