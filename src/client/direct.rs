//! Seam to the platform's peer-connection primitive.
//!
//! Negotiation itself (SDP/ICE) happens behind [`DirectSession`]; the
//! controller only forwards its signal blobs and waits for `Connected`.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::signaling::Frame;

#[derive(Debug, Clone)]
pub struct DirectParams {
    /// The host initiates, the guest answers.
    pub initiator: bool,
    pub ice_servers: Vec<IceServer>,
}

/// Events a direct session reports back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectEvent {
    /// Negotiation blob to forward to the other peer via signaling.
    Signal(Value),
    /// The data channel is open.
    Connected,
    Data(Frame),
    Closed,
    Error(String),
}

pub trait DirectSession: Send + 'static {
    /// Feeds a negotiation blob received from the other peer.
    fn signal(&mut self, payload: Value);

    fn is_writable(&self) -> bool;

    fn send(&mut self, frame: Frame);

    /// Tears the session down. Events emitted afterwards are ignored.
    fn close(&mut self);
}

pub trait DirectConnector: Send + Sync + 'static {
    type Session: DirectSession;

    /// Starts a negotiation; the session reports through `events`.
    fn open(&self, params: DirectParams, events: mpsc::UnboundedSender<DirectEvent>) -> Self::Session;
}
