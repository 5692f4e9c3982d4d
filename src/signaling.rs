//! WebSocket rendezvous server: room codes, signaling and relay

mod actor;
mod code;
mod handler;
mod messages;
mod server;
mod types;

pub use actor::RoomRegistryHandle;
pub use code::{ALPHABET, BASE_LEN, CODE_LEN, CodeAllocator, checksum};
pub use handler::{FrameHandler, RelayHandler, SignalingHandler, SignalingState};
pub use messages::Envelope;
pub use server::{DEFAULT_RELAY_PORT, DEFAULT_SIGNALING_PORT, RelayServer, RoomServer, SignalingServer};
pub use types::{CodeError, ConnId, Frame, Member, RoomCode, SignalingError};
