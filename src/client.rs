//! Client endpoint: login, presence, and both sides of a transfer

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::channel::{SecureChannel, Transport};
use crate::error::{FrameError, RelayError, TransferError};
use crate::message::{FileMetadata, OfferNotice, Request, ServerMessage, TransferReport, TransferRequest};
use crate::negotiation::Outcome;
use crate::protocol::{timeouts, DEFAULT_MAX_FRAME_SIZE};
use crate::tls::{self, ServerTrust};
use crate::transfer;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

pub struct Client {
    channel: SecureChannel,
    username: Option<String>,
    idle: Duration,
    /// Offers that arrived while another reply was awaited
    offers: VecDeque<OfferNotice>,
}

impl Client {
    pub fn new<T: Transport>(transport: T, peer: SocketAddr) -> Self {
        Self {
            channel: SecureChannel::new(transport, peer, DEFAULT_MAX_FRAME_SIZE),
            username: None,
            idle: Duration::from_secs(timeouts::TRANSFER_IDLE_SECS),
            offers: VecDeque::new(),
        }
    }

    pub async fn connect_tls(host: &str, port: u16, trust: &ServerTrust) -> Result<Client> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("timed out connecting to {}", addr))?
            .with_context(|| format!("connect {}", addr))?;
        let _ = tcp.set_nodelay(true);
        let peer = tcp.peer_addr().context("peer address")?;

        let cx = TlsConnector::from(Arc::new(tls::build_client_config(host, port, trust)));
        let server_name = tls::server_name_for(host)?;
        let stream = timeout(CONNECT_TIMEOUT, cx.connect(server_name, tcp))
            .await
            .map_err(|_| anyhow!("TLS handshake with {} timed out", addr))?
            .with_context(|| format!("TLS handshake with {}", addr))?;
        debug!(%peer, "connected");
        Ok(Client::new(stream, peer))
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    async fn send(&self, req: Request) -> Result<(), RelayError> {
        self.channel.send_envelope(&req.into_envelope()).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<ServerMessage, RelayError> {
        let env = self.channel.read_envelope().await?;
        ServerMessage::parse(&env)
            .map_err(|e| RelayError::Protocol(FrameError::MalformedEnvelope(e.to_string())))
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), RelayError> {
        self.send(Request::Login { username: username.to_string(), password: password.to_string() })
            .await?;
        match self.next_message().await? {
            ServerMessage::LoginResult(true) => {
                self.username = Some(username.to_string());
                Ok(())
            }
            ServerMessage::LoginResult(false) => {
                Err(RelayError::AuthFailure(format!("relay rejected credentials for {username}")))
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn ready_users(&mut self) -> Result<Vec<String>, RelayError> {
        self.send(Request::ReadyList(self.username.clone())).await?;
        loop {
            match self.next_message().await? {
                ServerMessage::ReadyList(users) => return Ok(users),
                other => self.set_aside(other),
            }
        }
    }

    pub async fn mark_ready(&self) -> Result<(), RelayError> {
        self.send(Request::MarkReady).await
    }

    pub async fn mark_unready(&self) -> Result<(), RelayError> {
        self.send(Request::MarkUnready).await
    }

    /// Ask to send `path` to `to`, and stream it once accepted
    pub async fn send_file(
        &mut self,
        to: &str,
        path: &Path,
        on_progress: impl FnMut(u64),
    ) -> Result<TransferReport, RelayError> {
        let from = self
            .username
            .clone()
            .ok_or_else(|| RelayError::AuthFailure("not logged in".into()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RelayError::from(TransferError::InvalidMetadata(format!("{} has no file name", path.display()))))?;
        let filesize = tokio::fs::metadata(path).await?.len();

        self.send(Request::SendRequest(TransferRequest {
            from_user: from,
            to_user: to.to_string(),
            filename: filename.clone(),
        }))
        .await?;

        loop {
            match self.next_message().await? {
                ServerMessage::GoAhead(Some(true)) => break,
                ServerMessage::GoAhead(Some(false)) => {
                    return Err(RelayError::NegotiationFailure(Outcome::Declined))
                }
                ServerMessage::GoAhead(None) => {
                    return Err(RelayError::NegotiationFailure(Outcome::NoResponse))
                }
                other => self.set_aside(other),
            }
        }
        info!(%to, file = %filename, size = filesize, "request accepted, sending");

        self.send(Request::Metadata(FileMetadata { filename, filesize })).await?;
        transfer::send_file(self.channel.writer(), path, filesize, on_progress).await?;

        loop {
            match self.next_message().await? {
                ServerMessage::SenderReport(report) => return finished(report),
                other => self.set_aside(other),
            }
        }
    }

    /// Block until someone offers a file
    pub async fn next_offer(&mut self) -> Result<OfferNotice, RelayError> {
        if let Some(offer) = self.offers.pop_front() {
            return Ok(offer);
        }
        loop {
            match self.next_message().await? {
                ServerMessage::Offer(offer) => return Ok(offer),
                other => debug!(?other, "skipping message while waiting for an offer"),
            }
        }
    }

    /// Accept the pending offer and write the file under `dest_dir`.
    /// `on_progress` sees `(received, expected)`.
    pub async fn accept(
        &mut self,
        dest_dir: &Path,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<(PathBuf, TransferReport), RelayError> {
        self.send(Request::Decide(true)).await?;
        let meta = match self.next_message().await? {
            ServerMessage::Metadata(meta) => meta,
            ServerMessage::TargetOutcome(None) => {
                return Err(RelayError::NegotiationFailure(Outcome::PeerGone))
            }
            other => return Err(unexpected(&other)),
        };
        let dest = transfer::destination_path(dest_dir, &meta.filename)?;
        tokio::fs::create_dir_all(dest_dir).await?;
        info!(file = %meta.filename, size = meta.filesize, dest = %dest.display(), "receiving");

        let (reader, writer) = self.channel.parts_mut();
        let expected = meta.filesize;
        let received =
            transfer::receive_file(reader, &dest, expected, self.idle, |n| on_progress(n, expected)).await;
        if let Err(TransferError::ConnectionLost { .. }) = &received {
            writer.mark_dead();
        }
        received?;

        match self.next_message().await? {
            ServerMessage::ReceiverReport(report) => Ok((dest, finished(report)?)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn decline(&mut self) -> Result<(), RelayError> {
        self.send(Request::Decide(false)).await?;
        match self.next_message().await? {
            ServerMessage::TargetOutcome(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close(self) {
        self.channel.close().await;
    }

    /// Keep offers for `next_offer`; a withdrawal cancels the one queued
    fn set_aside(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Offer(offer) => {
                debug!(from = %offer.from_user, file = %offer.file_name, "offer queued");
                self.offers.push_back(offer);
            }
            ServerMessage::TargetOutcome(None) if !self.offers.is_empty() => {
                self.offers.pop_front();
            }
            other => debug!(?other, "skipping unrelated message"),
        }
    }
}

fn finished(report: TransferReport) -> Result<TransferReport, RelayError> {
    if report.complete {
        Ok(report)
    } else {
        Err(RelayError::TransferIncomplete { transferred: report.transferred, expected: report.expected })
    }
}

fn unexpected(msg: &ServerMessage) -> RelayError {
    RelayError::Protocol(FrameError::MalformedEnvelope(format!("unexpected reply {msg:?}")))
}
