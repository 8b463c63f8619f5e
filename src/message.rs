//! Typed view of the envelope table
//!
//! Routing is resolved once, here, from the `(action, sub_action)` pair into a
//! [`Request`] (client to relay) or a [`ServerMessage`] (relay to client).
//! Nothing else in the crate reads `data` fields by hand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::frame::Envelope;
use crate::protocol::{action, sub};

#[derive(Debug, Error, PartialEq)]
pub enum MessageError {
    #[error("unknown route action={0} sub-action={1}")]
    UnknownRoute(u8, u8),

    #[error("bad payload for action={action} sub-action={sub_action}: {reason}")]
    BadPayload { action: u8, sub_action: u8, reason: String },
}

impl MessageError {
    fn bad(env: &Envelope, reason: impl Into<String>) -> Self {
        MessageError::BadPayload {
            action: env.action,
            sub_action: env.sub_action,
            reason: reason.into(),
        }
    }
}

/// `{from_user, to_user, filename}`; travels as `[from, to, filename]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from_user: String,
    pub to_user: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub filesize: u64,
}

impl FileMetadata {
    pub fn validate(&self) -> Result<(), String> {
        if self.filename.trim().is_empty() {
            return Err("empty filename".into());
        }
        if self.filename.contains('\0') {
            return Err("filename contains NUL".into());
        }
        Ok(())
    }
}

/// What a target sees when someone wants to send it a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferNotice {
    pub from_user: String,
    pub file_name: String,
}

/// End-of-transfer summary sent to both parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub filename: String,
    pub transferred: u64,
    pub expected: u64,
    pub complete: bool,
}

impl TransferReport {
    pub fn new(filename: impl Into<String>, transferred: u64, expected: u64) -> Self {
        Self {
            filename: filename.into(),
            transferred,
            expected,
            complete: transferred == expected,
        }
    }
}

/// Client to relay
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Login { username: String, password: String },
    /// Carries the requester's name; the relay answers from the session's identity
    ReadyList(Option<String>),
    SendRequest(TransferRequest),
    Metadata(FileMetadata),
    MarkReady,
    MarkUnready,
    /// `true` accepts the pending offer, `false` declines it
    Decide(bool),
    /// Reserved sub-domain action; carried through so the session can log it
    Domain(u8),
}

impl Request {
    pub fn parse(env: &Envelope) -> Result<Request, MessageError> {
        match env.route() {
            (action::AUTH, sub::LOGIN) => {
                let (username, password) = string_pair(env)?;
                Ok(Request::Login { username, password })
            }
            (action::SEND, sub::READY_LIST) => Ok(Request::ReadyList(env.data.as_str().map(str::to_string))),
            (action::SEND, sub::SEND_REQUEST) => {
                let parts = strings(env, 3)?;
                let mut it = parts.into_iter();
                match (it.next(), it.next(), it.next()) {
                    (Some(from_user), Some(to_user), Some(filename)) => {
                        Ok(Request::SendRequest(TransferRequest { from_user, to_user, filename }))
                    }
                    _ => Err(MessageError::bad(env, "expected [from, to, filename]")),
                }
            }
            (action::SEND, sub::GO_AHEAD) => Ok(Request::Metadata(payload(env)?)),
            (action::RECEIVE, sub::READY) => Ok(Request::MarkReady),
            (action::RECEIVE, sub::ACCEPT) => Ok(Request::Decide(true)),
            (action::RECEIVE, sub::DECIDE) => match env.data {
                Value::Bool(b) => Ok(Request::Decide(b)),
                _ => Err(MessageError::bad(env, "expected a boolean decision")),
            },
            (action::RECEIVE, sub::UNREADY) => Ok(Request::MarkUnready),
            (action::DOMAIN, s) => Ok(Request::Domain(s)),
            (a, s) => Err(MessageError::UnknownRoute(a, s)),
        }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            Request::Login { username, password } => {
                Envelope::new(action::AUTH, sub::LOGIN, json!([username, password]))
            }
            Request::ReadyList(user) => Envelope::new(action::SEND, sub::READY_LIST, json!(user)),
            Request::SendRequest(r) => Envelope::new(
                action::SEND,
                sub::SEND_REQUEST,
                json!([r.from_user, r.to_user, r.filename]),
            ),
            Request::Metadata(m) => Envelope::new(action::SEND, sub::GO_AHEAD, to_value(&m)),
            Request::MarkReady => Envelope::new(action::RECEIVE, sub::READY, Value::Null),
            Request::MarkUnready => Envelope::new(action::RECEIVE, sub::UNREADY, Value::Null),
            Request::Decide(true) => Envelope::new(action::RECEIVE, sub::ACCEPT, Value::Null),
            Request::Decide(false) => Envelope::new(action::RECEIVE, sub::DECIDE, false),
            Request::Domain(s) => Envelope::new(action::DOMAIN, s, Value::Null),
        }
    }
}

/// Relay to client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    LoginResult(bool),
    ReadyList(Vec<String>),
    /// Sent to a target: `Some(false)` acknowledges a decline, `None` withdraws the offer
    TargetOutcome(Option<bool>),
    /// Sent to an initiator: accepted / declined / no response
    GoAhead(Option<bool>),
    Offer(OfferNotice),
    Metadata(FileMetadata),
    SenderReport(TransferReport),
    ReceiverReport(TransferReport),
}

impl ServerMessage {
    pub fn parse(env: &Envelope) -> Result<ServerMessage, MessageError> {
        match env.route() {
            (action::REPLY, sub::LOGIN_RESULT) => match env.data {
                Value::Bool(b) => Ok(ServerMessage::LoginResult(b)),
                _ => Err(MessageError::bad(env, "expected a boolean")),
            },
            (action::SEND, sub::READY_LIST) => {
                let users = match &env.data {
                    Value::Null => Vec::new(),
                    _ => strings(env, usize::MAX)?,
                };
                Ok(ServerMessage::ReadyList(users))
            }
            (action::SEND, sub::SEND_REQUEST) => Ok(ServerMessage::TargetOutcome(tri_state(env)?)),
            (action::SEND, sub::GO_AHEAD) => Ok(ServerMessage::GoAhead(tri_state(env)?)),
            (action::SEND, sub::SENDER_REPORT) => Ok(ServerMessage::SenderReport(payload(env)?)),
            (action::RECEIVE, sub::READY) => Ok(ServerMessage::Metadata(payload(env)?)),
            (action::RECEIVE, sub::ACCEPT) => Ok(ServerMessage::Offer(payload(env)?)),
            (action::RECEIVE, sub::RECEIVER_REPORT) => Ok(ServerMessage::ReceiverReport(payload(env)?)),
            (a, s) => Err(MessageError::UnknownRoute(a, s)),
        }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            ServerMessage::LoginResult(ok) => Envelope::new(action::REPLY, sub::LOGIN_RESULT, ok),
            ServerMessage::ReadyList(users) => Envelope::new(action::SEND, sub::READY_LIST, json!(users)),
            ServerMessage::TargetOutcome(v) => Envelope::new(action::SEND, sub::SEND_REQUEST, json!(v)),
            ServerMessage::GoAhead(v) => Envelope::new(action::SEND, sub::GO_AHEAD, json!(v)),
            ServerMessage::Offer(o) => Envelope::new(action::RECEIVE, sub::ACCEPT, to_value(&o)),
            ServerMessage::Metadata(m) => Envelope::new(action::RECEIVE, sub::READY, to_value(&m)),
            ServerMessage::SenderReport(r) => Envelope::new(action::SEND, sub::SENDER_REPORT, to_value(&r)),
            ServerMessage::ReceiverReport(r) => {
                Envelope::new(action::RECEIVE, sub::RECEIVER_REPORT, to_value(&r))
            }
        }
    }
}

fn to_value<T: Serialize>(v: &T) -> Value {
    // Plain structs of strings and integers always serialize
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn payload<T: DeserializeOwned>(env: &Envelope) -> Result<T, MessageError> {
    T::deserialize(&env.data).map_err(|e| MessageError::bad(env, e.to_string()))
}

fn tri_state(env: &Envelope) -> Result<Option<bool>, MessageError> {
    match env.data {
        Value::Bool(b) => Ok(Some(b)),
        Value::Null => Ok(None),
        _ => Err(MessageError::bad(env, "expected true, false or null")),
    }
}

fn strings(env: &Envelope, expected: usize) -> Result<Vec<String>, MessageError> {
    let items = env
        .data
        .as_array()
        .ok_or_else(|| MessageError::bad(env, "expected an array"))?;
    if expected != usize::MAX && items.len() != expected {
        return Err(MessageError::bad(
            env,
            format!("expected {} items, got {}", expected, items.len()),
        ));
    }
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| MessageError::bad(env, "expected strings"))
        })
        .collect()
}

fn string_pair(env: &Envelope) -> Result<(String, String), MessageError> {
    let mut parts = strings(env, 2)?.into_iter();
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(MessageError::bad(env, "expected [username, password]")),
    }
}
