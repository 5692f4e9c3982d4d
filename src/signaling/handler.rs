//! Per-connection frame handlers.
//!
//! Both endpoints share the registry discipline and differ only in how
//! they read frames: the signaling handler interprets every frame as an
//! [`Envelope`], the relay handler interprets only its first `join`.

use std::future::Future;

use tracing::{debug, warn};

use super::actor::RoomRegistryHandle;
use super::messages::Envelope;
use super::types::{Frame, Member, RoomCode, SignalingError};

pub trait FrameHandler: Send + 'static {
    /// Endpoint name used in logs.
    const KIND: &'static str;

    /// Whether room members are told about joins and leaves in-band.
    const ANNOUNCE_MEMBERSHIP: bool;

    fn new(member: Member, registry: RoomRegistryHandle) -> Self;

    fn on_frame(&mut self, frame: Frame) -> impl Future<Output = ()> + Send;

    fn on_close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Room role of a signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Unassociated,
    Hosting(RoomCode),
    Guest(RoomCode),
}

pub struct SignalingHandler {
    member: Member,
    registry: RoomRegistryHandle,
    state: SignalingState,
}

impl SignalingHandler {
    pub fn state(&self) -> SignalingState {
        self.state
    }

    fn reply(&self, envelope: &Envelope) {
        match envelope.to_frame() {
            Ok(frame) => {
                self.member.deliver(frame);
            }
            Err(e) => warn!("Failed to encode reply for {}: {}", self.member.id, e),
        }
    }

    fn reply_error(&self, err: &SignalingError) {
        debug!("{}: {}", self.member.id, err);
        self.reply(&Envelope::Error {
            reason: err.wire_reason().to_string(),
        });
    }

    async fn create(&mut self) {
        match self.registry.create(self.member.clone()).await {
            Ok(code) => {
                self.state = SignalingState::Hosting(code);
                self.reply(&Envelope::Created { code });
            }
            Err(e) => self.reply_error(&e),
        }
    }

    async fn join(&mut self, typed: &str) {
        // A code that does not parse cannot name an open room.
        let Ok(code) = RoomCode::parse(typed) else {
            self.reply(&Envelope::Error {
                reason: "NO_ROOM".to_string(),
            });
            return;
        };

        match self.registry.join(code, self.member.clone()).await {
            Ok(()) => {
                self.state = SignalingState::Guest(code);
                self.reply(&Envelope::Joined { code });
            }
            Err(e) => self.reply_error(&e),
        }
    }
}

impl FrameHandler for SignalingHandler {
    const KIND: &'static str = "signaling";
    const ANNOUNCE_MEMBERSHIP: bool = true;

    fn new(member: Member, registry: RoomRegistryHandle) -> Self {
        Self {
            member,
            registry,
            state: SignalingState::Unassociated,
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let Frame::Text(text) = frame else {
            debug!("Ignoring binary frame from {}", self.member.id);
            return;
        };
        let Some(envelope) = Envelope::parse(&text) else {
            debug!("Ignoring malformed frame from {}", self.member.id);
            return;
        };

        match (envelope, self.state) {
            (Envelope::Create, SignalingState::Unassociated) => self.create().await,
            (Envelope::Join { code }, SignalingState::Unassociated) => self.join(&code).await,
            (Envelope::Signal { payload }, SignalingState::Hosting(_) | SignalingState::Guest(_)) => {
                // Only `type` and `payload` reach the peer.
                match (Envelope::Signal { payload }).to_frame() {
                    Ok(frame) => self.registry.relay(self.member.id, frame).await,
                    Err(e) => warn!("Failed to encode signal from {}: {}", self.member.id, e),
                }
            }
            (Envelope::Leave, SignalingState::Hosting(code) | SignalingState::Guest(code)) => {
                debug!("{} leaves room {}", self.member.id, code);
                self.registry.leave(self.member.id).await;
                self.state = SignalingState::Unassociated;
            }
            (envelope, state) => {
                debug!(
                    "Ignoring {:?} from {} in state {:?}",
                    envelope, self.member.id, state
                );
            }
        }
    }

    async fn on_close(&mut self) {
        self.registry.leave(self.member.id).await;
    }
}

/// Fallback data path: one `join` frame, then opaque passthrough.
pub struct RelayHandler {
    member: Member,
    registry: RoomRegistryHandle,
    room: Option<RoomCode>,
}

impl RelayHandler {
    pub fn room(&self) -> Option<RoomCode> {
        self.room
    }

    async fn try_join(&mut self, frame: &Frame) {
        let code = match frame {
            Frame::Text(text) => match Envelope::parse(text) {
                Some(Envelope::Join { code }) => code,
                _ => {
                    debug!("Dropping frame from {} before join", self.member.id);
                    return;
                }
            },
            Frame::Binary(_) => {
                debug!("Dropping binary frame from {} before join", self.member.id);
                return;
            }
        };

        let code = match RoomCode::parse(&code) {
            Ok(code) => code,
            Err(e) => {
                warn!("Relay join from {} with bad code: {}", self.member.id, e);
                return;
            }
        };

        match self
            .registry
            .join_or_create(code, self.member.clone())
            .await
        {
            Ok(()) => self.room = Some(code),
            Err(e) => warn!("Relay join from {} failed: {}", self.member.id, e),
        }
    }
}

impl FrameHandler for RelayHandler {
    const KIND: &'static str = "relay";
    // Every frame on the relay is payload.
    const ANNOUNCE_MEMBERSHIP: bool = false;

    fn new(member: Member, registry: RoomRegistryHandle) -> Self {
        Self {
            member,
            registry,
            room: None,
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        if self.room.is_none() {
            self.try_join(&frame).await;
            return;
        }
        self.registry.relay(self.member.id, frame).await;
    }

    async fn on_close(&mut self) {
        self.registry.leave(self.member.id).await;
    }
}
