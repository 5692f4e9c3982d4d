//! Client side: one logical connection over a direct or relayed transport

mod channel;
mod controller;
mod direct;
mod types;

pub use channel::{Channel, Connector, WsConnector};
pub use controller::{TransportController, TransportEvents};
pub use direct::{DirectConnector, DirectEvent, DirectParams, DirectSession};
pub use types::{ClientError, Role, TransportEvent, TransportKind, TransportState};
