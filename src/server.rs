//! Accept loop and per-connection supervision

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::channel::{SecureChannel, Transport};
use crate::config::Config;
use crate::credentials::{CredentialStore, FileCredentials};
use crate::error::RelayError;
use crate::protocol::{timeouts, DEFAULT_MAX_FRAME_SIZE};
use crate::registry::Registry;
use crate::session::Session;
use crate::tls;

/// Per-connection bounds, resolved once from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_frame: usize,
    pub handshake: Duration,
    pub negotiation: Duration,
    pub transfer_idle: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME_SIZE,
            handshake: Duration::from_secs(timeouts::HANDSHAKE_SECS),
            negotiation: Duration::from_secs(timeouts::NEGOTIATION_SECS),
            transfer_idle: Duration::from_secs(timeouts::TRANSFER_IDLE_SECS),
        }
    }
}

impl From<&Config> for Limits {
    fn from(cfg: &Config) -> Self {
        Self {
            max_frame: cfg.max_frame_bytes,
            handshake: Duration::from_secs(cfg.handshake_timeout_secs),
            negotiation: Duration::from_secs(cfg.negotiation_timeout_secs),
            transfer_idle: Duration::from_secs(cfg.transfer_idle_timeout_secs),
        }
    }
}

/// State shared by every session unit of one relay
pub struct RelayContext {
    pub registry: Registry,
    pub credentials: Arc<dyn CredentialStore>,
    pub limits: Limits,
}

impl RelayContext {
    pub fn new(credentials: Arc<dyn CredentialStore>, limits: Limits) -> Arc<Self> {
        Arc::new(Self { registry: Registry::new(), credentials, limits })
    }
}

/// Authenticate one already-encrypted connection, then run its session unit
/// to completion. Rejected logins are closed here.
pub async fn serve_connection<T: Transport>(transport: T, peer: SocketAddr, ctx: Arc<RelayContext>) {
    let mut channel = SecureChannel::new(transport, peer, ctx.limits.max_frame);
    match auth::authenticate(&mut channel, ctx.credentials.as_ref(), ctx.limits.handshake).await {
        Ok(user) => Session::new(channel, &user, ctx).run().await,
        Err(e) => {
            match RelayError::from(e) {
                RelayError::Protocol(f) if f.is_disconnect() => {
                    debug!(%peer, "closed before logging in");
                }
                other => info!(%peer, error = %other, "login refused"),
            }
            channel.close().await;
        }
    }
}

async fn handle_tcp(tcp: TcpStream, peer: SocketAddr, acceptor: TlsAcceptor, ctx: Arc<RelayContext>) {
    let _ = tcp.set_nodelay(true);
    let tls = match timeout(ctx.limits.handshake, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(%peer, "TLS handshake timed out");
            return;
        }
    };
    debug!(%peer, "TLS established");
    serve_connection(tls, peer, ctx).await;
}

/// Accept until `shutdown` resolves. Each connection gets its own task; a
/// failing connection never stops the loop.
pub async fn serve_with_tls(
    listener: TcpListener,
    tls_config: rustls::ServerConfig,
    ctx: Arc<RelayContext>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let local = listener.local_addr().context("listener address")?;
    info!(addr = %local, "relay listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting connections");
                return Ok(());
            }
            res = listener.accept() => match res {
                Ok((tcp, peer)) => {
                    info!(%peer, "connection accepted");
                    tokio::spawn(handle_tcp(tcp, peer, acceptor.clone(), Arc::clone(&ctx)));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// Resolve TLS material and credentials from `cfg`, bind, and serve
pub async fn serve(cfg: &Config, shutdown: impl Future<Output = ()>) -> Result<()> {
    let tls_config = tls::load_or_generate_server_config(&cfg.cert_path, &cfg.key_path)?;
    let credentials = FileCredentials::open(&cfg.credentials_path)?;
    let ctx = RelayContext::new(Arc::new(credentials), Limits::from(cfg));
    let addr = cfg.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    serve_with_tls(listener, tls_config, ctx, shutdown).await
}
