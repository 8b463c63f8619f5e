//! Request / accept / decline between an initiator and a target
//!
//! The initiator's unit never touches the target's socket for reading. It
//! posts an [`Offer`] carrying a one-shot reply slot into the target's inbox
//! and waits on that slot. The target's own unit forwards the offer to its
//! client, reads the decision off its own socket, and answers through the
//! slot. Either side vanishing closes the slot, which the other side observes
//! as [`Outcome::PeerGone`] or as a withdrawn offer.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::debug;

use crate::message::{OfferNotice, TransferRequest};
use crate::registry::Registry;
use crate::session::SessionHandle;

/// How a negotiation ended, from the initiator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Declined,
    /// Target produced no decision within the bounded wait
    NoResponse,
    /// Target's session ended while the request was pending
    PeerGone,
    /// Target was not ready to receive when the request was made
    Unavailable,
    /// Target already had an offer pending
    Busy,
}

impl Outcome {
    /// Wire value of the go-ahead sent to the initiator
    pub fn go_ahead(self) -> Option<bool> {
        match self {
            Outcome::Accepted => Some(true),
            Outcome::Declined => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Accepted => "accepted",
            Outcome::Declined => "declined by recipient",
            Outcome::NoResponse => "no response from recipient",
            Outcome::PeerGone => "recipient disconnected",
            Outcome::Unavailable => "recipient is not ready to receive",
            Outcome::Busy => "recipient is busy with another request",
        };
        f.write_str(s)
    }
}

/// The target's answer, posted back through the reply slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Decline,
    Busy,
    Unavailable,
}

impl From<Decision> for Outcome {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Accept => Outcome::Accepted,
            Decision::Decline => Outcome::Declined,
            Decision::Busy => Outcome::Busy,
            Decision::Unavailable => Outcome::Unavailable,
        }
    }
}

/// A send request addressed to one session's inbox
#[derive(Debug)]
pub struct Offer {
    pub from_user: String,
    pub filename: String,
    pub reply: oneshot::Sender<Decision>,
}

/// Messages one session unit posts to another
#[derive(Debug)]
pub enum SessionEvent {
    Offer(Offer),
    /// The peer's byte stream can no longer be framed; end the session
    Abort { reason: String },
}

/// Post an offer to `request.to_user`, re-checking readiness at request time.
///
/// On success the caller owns the receiving end of the reply slot and the
/// target's handle (needed later to address its channel for the transfer).
pub fn open_offer(
    registry: &Registry,
    request: &TransferRequest,
) -> Result<(SessionHandle, oneshot::Receiver<Decision>), Outcome> {
    if request.to_user == request.from_user {
        return Err(Outcome::Unavailable);
    }
    let target = registry.lookup(&request.to_user).ok_or(Outcome::Unavailable)?;
    let (tx, rx) = oneshot::channel();
    let offer = Offer {
        from_user: request.from_user.clone(),
        filename: request.filename.clone(),
        reply: tx,
    };
    match target.inbox().try_send(SessionEvent::Offer(offer)) {
        Ok(()) => Ok((target, rx)),
        Err(mpsc::error::TrySendError::Full(_)) => Err(Outcome::Busy),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(Outcome::PeerGone),
    }
}

/// An initiator's side of an open offer: the reply slot and its deadline
pub struct PendingDecision {
    rx: oneshot::Receiver<Decision>,
    deadline: Pin<Box<Sleep>>,
}

impl PendingDecision {
    pub fn new(rx: oneshot::Receiver<Decision>, wait: Duration) -> Self {
        Self { rx, deadline: Box::pin(tokio::time::sleep(wait)) }
    }

    /// Resolve the slot under the bounded wait. Cancel-safe.
    ///
    /// At the deadline the slot is closed first, so a decision that raced
    /// the timer is still honoured and a later one is refused at the target.
    pub async fn outcome(&mut self) -> Outcome {
        tokio::select! {
            biased;
            reply = &mut self.rx => resolve(reply),
            _ = &mut self.deadline => {
                self.rx.close();
                match self.rx.try_recv() {
                    Ok(decision) => decision.into(),
                    Err(_) => Outcome::NoResponse,
                }
            }
        }
    }

    /// Stop waiting before an outcome. Returns a decision that was already
    /// posted, which the caller must undo if it was an accept.
    pub fn abandon(mut self) -> Option<Decision> {
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

/// A closed slot means the target's session ended without answering
fn resolve(reply: Result<Decision, oneshot::error::RecvError>) -> Outcome {
    match reply {
        Ok(decision) => decision.into(),
        Err(_) => Outcome::PeerGone,
    }
}

/// Result of a target's accept/decline against its slot
#[derive(Debug, PartialEq, Eq)]
pub enum Settled {
    /// No offer was pending
    NothingPending,
    /// Decision reached the initiator
    Delivered { from_user: String, filename: String, accepted: bool },
    /// Initiator had already given up
    Withdrawn { from_user: String, filename: String },
}

/// Target-side holder for at most one pending offer
#[derive(Debug, Default)]
pub struct OfferSlot {
    pending: Option<Offer>,
}

impl OfferSlot {
    /// Take in an offer. Returns the notice to forward to the client, or
    /// answers the initiator immediately when the offer cannot be held.
    pub fn receive(&mut self, offer: Offer, ready: bool) -> Option<OfferNotice> {
        if !ready {
            let _ = offer.reply.send(Decision::Unavailable);
            return None;
        }
        if self.pending.is_some() {
            let _ = offer.reply.send(Decision::Busy);
            return None;
        }
        if offer.reply.is_closed() {
            debug!(from = %offer.from_user, "offer withdrawn before delivery");
            return None;
        }
        let notice = OfferNotice {
            from_user: offer.from_user.clone(),
            file_name: offer.filename.clone(),
        };
        self.pending = Some(offer);
        Some(notice)
    }

    pub fn decide(&mut self, accept: bool) -> Settled {
        let Some(offer) = self.pending.take() else {
            return Settled::NothingPending;
        };
        let decision = if accept { Decision::Accept } else { Decision::Decline };
        match offer.reply.send(decision) {
            Ok(()) => Settled::Delivered {
                from_user: offer.from_user,
                filename: offer.filename,
                accepted: accept,
            },
            Err(_) => Settled::Withdrawn {
                from_user: offer.from_user,
                filename: offer.filename,
            },
        }
    }

    /// Resolves once the initiator drops its end of the pending reply slot.
    /// Never resolves while nothing is pending.
    pub async fn withdrawn(&mut self) {
        match self.pending.as_mut() {
            Some(offer) => offer.reply.closed().await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Remove the pending offer without answering it
    pub fn take(&mut self) -> Option<Offer> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn await_decision(rx: oneshot::Receiver<Decision>, wait: Duration) -> Outcome {
        PendingDecision::new(rx, wait).outcome().await
    }

    fn offer(from: &str) -> (Offer, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        (Offer { from_user: from.into(), filename: "report.pdf".into(), reply: tx }, rx)
    }

    #[tokio::test]
    async fn accept_reaches_initiator() {
        let mut slot = OfferSlot::default();
        let (o, rx) = offer("bob");
        let notice = slot.receive(o, true).unwrap();
        assert_eq!(notice.from_user, "bob");
        assert_eq!(notice.file_name, "report.pdf");
        assert_eq!(
            slot.decide(true),
            Settled::Delivered { from_user: "bob".into(), filename: "report.pdf".into(), accepted: true }
        );
        assert_eq!(await_decision(rx, Duration::from_secs(1)).await, Outcome::Accepted);
    }

    #[tokio::test]
    async fn decline_reaches_initiator() {
        let mut slot = OfferSlot::default();
        let (o, rx) = offer("bob");
        slot.receive(o, true).unwrap();
        assert!(matches!(slot.decide(false), Settled::Delivered { accepted: false, .. }));
        assert_eq!(await_decision(rx, Duration::from_secs(1)).await, Outcome::Declined);
    }

    #[tokio::test]
    async fn second_offer_is_busy_and_unready_is_unavailable() {
        let mut slot = OfferSlot::default();
        let (first, _rx1) = offer("bob");
        slot.receive(first, true).unwrap();
        let (second, rx2) = offer("carol");
        assert!(slot.receive(second, true).is_none());
        assert_eq!(await_decision(rx2, Duration::from_secs(1)).await, Outcome::Busy);

        let mut idle = OfferSlot::default();
        let (o, rx) = offer("bob");
        assert!(idle.receive(o, false).is_none());
        assert_eq!(await_decision(rx, Duration::from_secs(1)).await, Outcome::Unavailable);
    }

    #[tokio::test]
    async fn silent_target_is_no_response_and_dropped_slot_is_peer_gone() {
        let (o, rx) = offer("bob");
        assert_eq!(await_decision(rx, Duration::from_millis(20)).await, Outcome::NoResponse);
        drop(o);

        let (o, rx) = offer("bob");
        drop(o);
        assert_eq!(await_decision(rx, Duration::from_secs(1)).await, Outcome::PeerGone);
    }

    #[tokio::test]
    async fn initiator_giving_up_is_observed_by_target() {
        let mut slot = OfferSlot::default();
        let (o, rx) = offer("bob");
        slot.receive(o, true).unwrap();
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), slot.withdrawn()).await.unwrap();
        assert_eq!(
            slot.decide(true),
            Settled::Withdrawn { from_user: "bob".into(), filename: "report.pdf".into() }
        );
        assert_eq!(slot.decide(true), Settled::NothingPending);
    }

    #[tokio::test]
    async fn abandoning_surfaces_an_accept_already_posted() {
        let mut slot = OfferSlot::default();
        let (o, rx) = offer("bob");
        slot.receive(o, true).unwrap();
        let pending = PendingDecision::new(rx, Duration::from_secs(60));
        assert!(matches!(slot.decide(true), Settled::Delivered { accepted: true, .. }));
        assert_eq!(pending.abandon(), Some(Decision::Accept));

        // Nothing posted yet: the slot closes and a late accept is refused
        let (o, rx) = offer("bob");
        slot.receive(o, true).unwrap();
        assert_eq!(PendingDecision::new(rx, Duration::from_secs(60)).abandon(), None);
        assert!(matches!(slot.decide(true), Settled::Withdrawn { .. }));
    }

    #[tokio::test]
    async fn decision_after_the_deadline_is_refused_at_the_target() {
        let mut slot = OfferSlot::default();
        let (o, rx) = offer("bob");
        slot.receive(o, true).unwrap();
        assert_eq!(await_decision(rx, Duration::from_millis(10)).await, Outcome::NoResponse);
        assert!(matches!(slot.decide(true), Settled::Withdrawn { .. }));
    }

    #[tokio::test]
    async fn withdrawn_never_fires_when_idle() {
        let mut slot = OfferSlot::default();
        let res = tokio::time::timeout(Duration::from_millis(20), slot.withdrawn()).await;
        assert!(res.is_err());
    }

    #[test]
    fn go_ahead_encoding() {
        assert_eq!(Outcome::Accepted.go_ahead(), Some(true));
        assert_eq!(Outcome::Declined.go_ahead(), Some(false));
        for o in [Outcome::NoResponse, Outcome::PeerGone, Outcome::Unavailable, Outcome::Busy] {
            assert_eq!(o.go_ahead(), None);
        }
    }
}
