//! Error types shared by the relay and the client endpoints

use std::io;

use thiserror::Error;

use crate::negotiation::Outcome;

/// Failures while reading or writing one envelope
#[derive(Debug, Error)]
pub enum FrameError {
    /// Peer closed before a full length prefix arrived. Normal disconnect.
    #[error("peer closed the connection")]
    ShortRead,

    /// Peer closed in the middle of a frame body
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    TruncatedFrame { expected: usize, received: usize },

    #[error("frame too large: {len} bytes (max: {max} bytes)")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer simply went away rather than misbehaving
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameError::ShortRead)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials rejected: {0}")]
    Rejected(String),

    #[error("login did not complete within {0} seconds")]
    Timeout(u64),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Endpoint-side streaming failures
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("connection lost after {transferred} of {expected} bytes")]
    ConnectionLost { transferred: u64, expected: u64 },

    #[error("invalid file metadata: {0}")]
    InvalidMetadata(String),

    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Error taxonomy as surfaced by a session or a client call
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(FrameError),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailure(Outcome),

    #[error("transfer incomplete: {transferred} of {expected} bytes")]
    TransferIncomplete { transferred: u64, expected: u64 },
}

impl From<FrameError> for RelayError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => RelayError::Transport(io),
            other => RelayError::Protocol(other),
        }
    }
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Frame(f) => f.into(),
            other => RelayError::AuthFailure(other.to_string()),
        }
    }
}

impl From<TransferError> for RelayError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::ConnectionLost { transferred, expected } => {
                RelayError::TransferIncomplete { transferred, expected }
            }
            TransferError::Io(io) => RelayError::Transport(io),
            TransferError::Frame(f) => f.into(),
            TransferError::InvalidMetadata(msg) => {
                RelayError::Protocol(FrameError::MalformedEnvelope(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_io_maps_to_transport() {
        let e: RelayError = FrameError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "x")).into();
        assert!(matches!(e, RelayError::Transport(_)));
        let e: RelayError = FrameError::MalformedEnvelope("bad".into()).into();
        assert!(matches!(e, RelayError::Protocol(_)));
    }

    #[test]
    fn connection_lost_maps_to_incomplete() {
        let e: RelayError = TransferError::ConnectionLost { transferred: 4, expected: 10 }.into();
        match e {
            RelayError::TransferIncomplete { transferred, expected } => {
                assert_eq!((transferred, expected), (4, 10));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_read_is_a_disconnect() {
        assert!(FrameError::ShortRead.is_disconnect());
        assert!(!FrameError::TruncatedFrame { expected: 4, received: 1 }.is_disconnect());
    }
}
