//! Shared protocol constants for the FaIDS framed transport

// Length prefix: 4 bytes, big-endian, counts the UTF-8 JSON body that follows
pub const LENGTH_PREFIX: usize = 4;

// Default maximum frame body (16MB) - prevents memory exhaustion from a hostile length prefix
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Smallest limit a config may set; a ready-list or offer must still fit
pub const MIN_FRAME_SIZE_LIMIT: usize = 1024;

// Default relay port
pub const DEFAULT_PORT: u16 = 9040;

/// Action codes (the `action` key of every envelope)
pub mod action {
    /// Server replies to a login
    pub const REPLY: u8 = 0;
    /// File sending domain
    pub const SEND: u8 = 1;
    /// File receiving domain
    pub const RECEIVE: u8 = 2;
    /// Sub-domain requests (reserved, unimplemented on both sides)
    pub const DOMAIN: u8 = 3;
    pub const AUTH: u8 = 4;
}

/// Sub-action codes, grouped by the action they belong to
pub mod sub {
    // action::REPLY
    pub const LOGIN_RESULT: u8 = 0;

    // action::AUTH
    pub const LOGIN: u8 = 0;

    // action::SEND
    // c->s: request ready list; s->c: ready list
    pub const READY_LIST: u8 = 1;
    // c->s: [from, to, filename]; s->c (to target): false = decline acknowledged, null = withdrawn
    pub const SEND_REQUEST: u8 = 2;
    // s->c: go-ahead (true/false/null); c->s: file metadata
    pub const GO_AHEAD: u8 = 3;
    // s->c: transfer report for the sender
    pub const SENDER_REPORT: u8 = 4;

    // action::RECEIVE
    // c->s: mark ready; s->c: file metadata forwarded from the sender
    pub const READY: u8 = 1;
    // c->s: accept; s->c: incoming offer {from_user, file_name}
    pub const ACCEPT: u8 = 2;
    // c->s: decision bool (false = decline)
    pub const DECIDE: u8 = 3;
    // s->c: transfer report for the receiver
    pub const RECEIVER_REPORT: u8 = 4;
    // c->s: withdraw readiness
    pub const UNREADY: u8 = 5;
}

// Centralized timeout defaults (seconds); all are overridable through Config
pub mod timeouts {
    // TLS handshake plus login frame
    pub const HANDSHAKE_SECS: u64 = 30;

    // How long an initiator waits for the target's decision, and for metadata after go-ahead
    pub const NEGOTIATION_SECS: u64 = 60;

    // Longest gap between two chunk reads while relaying or receiving
    pub const TRANSFER_IDLE_SECS: u64 = 60;

    // Progress tick interval for client UI updates (ms)
    pub const PROGRESS_TICK_MS: u64 = 250;
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Streaming granularity for a file of `filesize` bytes.
///
/// Sender, receiver and relay each call this independently on the same
/// declared size, so the chunk size never travels on the wire.
pub fn chunk_size_for(filesize: u64) -> usize {
    let bytes = if filesize < MIB {
        16 * KIB
    } else if filesize < 10 * MIB {
        64 * KIB
    } else if filesize < 100 * MIB {
        128 * KIB
    } else if filesize < GIB {
        512 * KIB
    } else if filesize < 10 * GIB {
        MIB
    } else if filesize < 50 * GIB {
        4 * MIB
    } else {
        8 * MIB
    };
    bytes as usize
}
