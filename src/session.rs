//! One execution unit per authenticated connection
//!
//! The unit is the only reader of its channel. Everything another unit needs
//! from it arrives as a [`SessionEvent`] in its inbox; everything it needs to
//! tell another party goes through that party's [`ChannelWriter`].

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelReader, ChannelWriter, SecureChannel};
use crate::error::{FrameError, RelayError};
use crate::frame::Envelope;
use crate::message::{Request, ServerMessage, TransferReport, TransferRequest};
use crate::negotiation::{self, Decision, OfferSlot, Outcome, PendingDecision, SessionEvent, Settled};
use crate::protocol::{action, sub};
use crate::server::RelayContext;
use crate::transfer;

/// Queued events per session before new offers are refused as busy
pub const INBOX_DEPTH: usize = 8;

// Frames a client may pipeline while its own send request is pending
const MAX_BACKLOG: usize = 32;

/// Addressable view of a live session, held by the registry and by
/// initiators during a negotiation.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    username: Arc<str>,
    peer: SocketAddr,
    writer: ChannelWriter,
    inbox: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn new(
        username: &str,
        peer: SocketAddr,
        writer: ChannelWriter,
        inbox: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: Arc::from(username),
            peer,
            writer,
            inbox,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    pub fn inbox(&self) -> &mpsc::Sender<SessionEvent> {
        &self.inbox
    }

    /// Channel still writable and the owning unit still running
    pub fn is_live(&self) -> bool {
        self.writer.is_live() && !self.inbox.is_closed()
    }

    /// Ask the owning unit to end the session
    pub fn abort(&self, reason: &str) {
        let event = SessionEvent::Abort { reason: reason.to_string() };
        if self.inbox.try_send(event).is_err() {
            debug!(user = %self.username, "abort not queued; session already ending");
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Why a session unit stopped
#[derive(Debug)]
enum End {
    Closed,
    Aborted(String),
    Fault(RelayError),
}

impl From<FrameError> for End {
    fn from(e: FrameError) -> Self {
        if e.is_disconnect() {
            End::Closed
        } else {
            End::Fault(e.into())
        }
    }
}

enum Step {
    Frame(Envelope),
    Event(SessionEvent),
    Withdrawn,
    Failed(FrameError),
}

pub struct Session {
    handle: SessionHandle,
    reader: ChannelReader,
    inbox: mpsc::Receiver<SessionEvent>,
    ctx: Arc<RelayContext>,
    offers: OfferSlot,
    ready: bool,
    backlog: VecDeque<Envelope>,
}

impl Session {
    pub fn new(channel: SecureChannel, username: &str, ctx: Arc<RelayContext>) -> Self {
        let peer = channel.peer();
        let (reader, writer) = channel.into_parts();
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        Self {
            handle: SessionHandle::new(username, peer, writer, tx),
            reader,
            inbox: rx,
            ctx,
            offers: OfferSlot::default(),
            ready: false,
            backlog: VecDeque::new(),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Serve frames and events until the channel closes, then tear down
    pub async fn run(mut self) {
        info!(user = %self.handle.username(), peer = %self.handle.peer(), id = %self.handle.id(), "session started");
        let end = self.serve().await;
        self.teardown(end).await;
    }

    async fn serve(&mut self) -> End {
        loop {
            let step = match self.backlog.pop_front() {
                Some(env) => Step::Frame(env),
                None => self.next_step().await,
            };
            let res = match step {
                Step::Frame(env) => self.dispatch(env).await,
                Step::Event(event) => self.on_event(event).await,
                Step::Withdrawn => self.on_withdrawn().await,
                Step::Failed(e) => Err(e.into()),
            };
            if let Err(end) = res {
                return end;
            }
        }
    }

    async fn next_step(&mut self) -> Step {
        tokio::select! {
            res = self.reader.read_envelope() => match res {
                Ok(env) => Step::Frame(env),
                Err(e) => Step::Failed(e),
            },
            Some(event) = self.inbox.recv() => Step::Event(event),
            _ = self.offers.withdrawn() => Step::Withdrawn,
        }
    }

    async fn reply(&self, msg: ServerMessage) -> Result<(), End> {
        self.handle.writer().send_envelope(&msg.into_envelope()).await?;
        Ok(())
    }

    async fn dispatch(&mut self, env: Envelope) -> Result<(), End> {
        let user = self.handle.username().to_string();
        let request = match Request::parse(&env) {
            Ok(r) => r,
            Err(e) => {
                warn!(%user, error = %e, "ignoring unroutable frame");
                if env.route() == (action::SEND, sub::SEND_REQUEST) {
                    self.reply(ServerMessage::GoAhead(None)).await?;
                }
                return Ok(());
            }
        };

        match request {
            Request::ReadyList(_) => {
                let ready = self.ctx.registry.snapshot(Some(&user));
                debug!(%user, count = ready.len(), "ready list requested");
                self.reply(ServerMessage::ReadyList(ready)).await
            }
            Request::SendRequest(req) => self.on_send_request(req).await,
            Request::MarkReady => {
                if let Some(old) = self.ctx.registry.mark_ready(self.handle.clone()) {
                    if old.id() != self.handle.id() {
                        info!(%user, replaced = %old.id(), "newer session took over ready entry");
                    }
                }
                self.ready = true;
                info!(%user, "ready to receive");
                Ok(())
            }
            Request::MarkUnready => {
                self.ctx.registry.mark_unready(&self.handle);
                self.ready = false;
                info!(%user, "no longer ready to receive");
                Ok(())
            }
            Request::Decide(accept) => self.on_decision(accept).await,
            Request::Metadata(meta) => {
                warn!(%user, file = %meta.filename, "metadata outside an accepted transfer");
                Ok(())
            }
            Request::Domain(s) => {
                debug!(%user, sub_action = s, "reserved sub-domain action ignored");
                Ok(())
            }
            Request::Login { .. } => {
                warn!(%user, "login repeated on an authenticated session");
                Ok(())
            }
        }
    }

    async fn on_event(&mut self, event: SessionEvent) -> Result<(), End> {
        match event {
            SessionEvent::Offer(offer) => {
                let from = offer.from_user.clone();
                match self.offers.receive(offer, self.ready) {
                    Some(notice) => {
                        info!(user = %self.handle.username(), %from, file = %notice.file_name, "offer forwarded");
                        self.reply(ServerMessage::Offer(notice)).await
                    }
                    None => {
                        debug!(user = %self.handle.username(), %from, "offer refused without prompting");
                        Ok(())
                    }
                }
            }
            SessionEvent::Abort { reason } => Err(End::Aborted(reason)),
        }
    }

    async fn on_withdrawn(&mut self) -> Result<(), End> {
        match self.offers.take() {
            Some(offer) => {
                info!(user = %self.handle.username(), from = %offer.from_user, "offer withdrawn by sender");
                self.reply(ServerMessage::TargetOutcome(None)).await
            }
            None => Ok(()),
        }
    }

    async fn on_decision(&mut self, accept: bool) -> Result<(), End> {
        let user = self.handle.username().to_string();
        match self.offers.decide(accept) {
            Settled::NothingPending => {
                warn!(%user, "decision with no pending offer");
                self.reply(ServerMessage::TargetOutcome(None)).await
            }
            Settled::Delivered { from_user, filename, accepted: true } => {
                self.ctx.registry.mark_unready(&self.handle);
                self.ready = false;
                info!(%user, from = %from_user, file = %filename, "offer accepted");
                Ok(())
            }
            Settled::Delivered { from_user, filename, accepted: false } => {
                info!(%user, from = %from_user, file = %filename, "offer declined");
                self.reply(ServerMessage::TargetOutcome(Some(false))).await
            }
            Settled::Withdrawn { from_user, .. } => {
                info!(%user, from = %from_user, "decision arrived after sender gave up");
                self.reply(ServerMessage::TargetOutcome(None)).await
            }
        }
    }

    async fn on_send_request(&mut self, req: TransferRequest) -> Result<(), End> {
        let user = self.handle.username().to_string();
        if req.from_user != user {
            warn!(%user, claimed = %req.from_user, "send request names another sender");
            return self.reply(ServerMessage::GoAhead(None)).await;
        }
        info!(from = %user, to = %req.to_user, file = %req.filename, "send requested");

        let (target, rx) = match negotiation::open_offer(&self.ctx.registry, &req) {
            Ok(opened) => opened,
            Err(outcome) => {
                info!(from = %user, to = %req.to_user, %outcome, "request refused");
                return self.reply(ServerMessage::GoAhead(outcome.go_ahead())).await;
            }
        };

        let outcome = self.wait_for_decision(&target, rx).await?;
        info!(from = %user, to = %req.to_user, %outcome, "negotiation settled");
        if let Err(end) = self.reply(ServerMessage::GoAhead(outcome.go_ahead())).await {
            if outcome == Outcome::Accepted {
                withdraw(&target).await;
            }
            return Err(end);
        }
        if outcome != Outcome::Accepted {
            return Ok(());
        }
        self.relay_to(&target).await
    }

    /// Wait on the reply slot while still serving this unit's own channel
    /// and inbox, so neither side can stall the other. Leaving early undoes
    /// an accept the target already posted.
    async fn wait_for_decision(
        &mut self,
        target: &SessionHandle,
        rx: oneshot::Receiver<Decision>,
    ) -> Result<Outcome, End> {
        let mut pending = PendingDecision::new(rx, self.ctx.limits.negotiation);
        let end = loop {
            tokio::select! {
                biased;
                outcome = pending.outcome() => return Ok(outcome),
                res = self.reader.read_envelope() => {
                    let env = match res {
                        Ok(env) => env,
                        Err(e) => break End::from(e),
                    };
                    if self.backlog.len() >= MAX_BACKLOG {
                        break End::Fault(RelayError::Protocol(FrameError::MalformedEnvelope(
                            "too many frames while a send request is pending".into(),
                        )));
                    }
                    self.backlog.push_back(env);
                }
                Some(event) = self.inbox.recv() => match event {
                    SessionEvent::Offer(offer) => {
                        let _ = offer.reply.send(Decision::Busy);
                    }
                    SessionEvent::Abort { reason } => break End::Aborted(reason),
                },
            }
        };
        if pending.abandon() == Some(Decision::Accept) {
            withdraw(target).await;
        }
        Err(end)
    }

    async fn next_metadata(&mut self) -> Result<Option<Envelope>, End> {
        if let Some(env) = self.backlog.pop_front() {
            return Ok(Some(env));
        }
        match timeout(self.ctx.limits.negotiation, self.reader.read_envelope()).await {
            Ok(res) => Ok(Some(res?)),
            Err(_) => Ok(None),
        }
    }

    async fn relay_to(&mut self, target: &SessionHandle) -> Result<(), End> {
        let user = self.handle.username().to_string();
        let env = match self.next_metadata().await {
            Ok(Some(env)) => env,
            Ok(None) => {
                warn!(%user, to = %target.username(), "no file metadata after go-ahead");
                withdraw(target).await;
                return Ok(());
            }
            Err(end) => {
                withdraw(target).await;
                return Err(end);
            }
        };

        let meta = match Request::parse(&env) {
            Ok(Request::Metadata(meta)) => match meta.validate() {
                Ok(()) => meta,
                Err(reason) => return self.reject_metadata(target, &meta.filename, &reason).await,
            },
            Ok(other) => {
                return self.reject_metadata(target, "", &format!("expected metadata, got {other:?}")).await
            }
            Err(e) => return self.reject_metadata(target, "", &e.to_string()).await,
        };

        let out = transfer::relay(&mut self.reader, target.writer(), &meta, self.ctx.limits.transfer_idle).await;
        let report = out.sender_report();

        if out.source_lost {
            // Target's stream is mid-file and cannot be re-framed
            target.writer().close().await;
            target.abort("sender lost mid-transfer");
            let _ = self.reply(ServerMessage::SenderReport(report)).await;
            return Err(End::Fault(RelayError::TransferIncomplete {
                transferred: out.delivered,
                expected: out.expected,
            }));
        }
        if out.sink_lost {
            target.writer().close().await;
            target.abort("recipient channel failed mid-transfer");
            warn!(from = %user, to = %target.username(), delivered = out.delivered, expected = out.expected, "transfer incomplete");
        } else {
            info!(from = %user, to = %target.username(), file = %meta.filename, bytes = out.delivered, "transfer complete");
        }
        self.reply(ServerMessage::SenderReport(report)).await
    }

    async fn reject_metadata(&self, target: &SessionHandle, filename: &str, reason: &str) -> Result<(), End> {
        warn!(user = %self.handle.username(), %reason, "invalid file metadata");
        withdraw(target).await;
        self.reply(ServerMessage::SenderReport(TransferReport {
            filename: filename.to_string(),
            transferred: 0,
            expected: 0,
            complete: false,
        }))
        .await
    }

    async fn teardown(mut self, end: End) {
        let user = self.handle.username().to_string();
        self.ctx.registry.mark_unready(&self.handle);
        self.inbox.close();
        // Dropping unanswered reply slots tells waiting initiators this party is gone
        self.offers.take();
        while self.inbox.try_recv().is_ok() {}
        self.handle.writer().close().await;

        match end {
            End::Closed => info!(%user, "session closed"),
            End::Aborted(reason) => warn!(%user, %reason, "session aborted"),
            End::Fault(e) => warn!(%user, error = %e, "session ended with error"),
        }
    }
}

/// Tell an accepted target that no file is coming after all
async fn withdraw(target: &SessionHandle) {
    let env = ServerMessage::TargetOutcome(None).into_envelope();
    if let Err(e) = target.writer().send_envelope(&env).await {
        debug!(user = %target.username(), error = %e, "could not notify recipient");
    }
}
