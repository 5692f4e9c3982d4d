use std::fmt;

use thiserror::Error;

use crate::signaling::{Frame, RoomCode};

/// Lifecycle of one client session.
///
/// `Idle -> Negotiating` is the only entry transition; `Negotiating` is left
/// exactly once, for `Direct` or `Relayed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Negotiating,
    Direct,
    Relayed,
    Closed,
}

/// Which path carries application messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Relayed,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => f.write_str("direct"),
            TransportKind::Relayed => f.write_str("relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the room and shares its code.
    Host,
    /// Joins the room named by the code.
    Guest(RoomCode),
}

/// Notifications for the layer above, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A transport was selected; sends are delivered from now on.
    Open(TransportKind),
    /// Application payload from the other peer, whichever path carried it.
    Message(Frame),
    /// The session ended. Sent once.
    Close,
    /// Recoverable condition reported by the server or a transport.
    Error(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("room not found")]
    RoomNotFound,

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("signaling connection closed")]
    SignalingClosed,

    #[error("operation not valid in state {0:?}")]
    InvalidState(TransportState),
}
