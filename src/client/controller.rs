//! Client transport controller.
//!
//! Races a direct-session negotiation against a fallback deadline and
//! exposes whichever transport wins as one send/receive surface. All
//! transitions happen under [`Shared`]'s lock, so the losing side of the
//! race always finds the state already moved on and does nothing.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel::{Channel, Connector};
use super::direct::{DirectConnector, DirectEvent, DirectParams, DirectSession};
use super::types::{ClientError, Role, TransportEvent, TransportKind, TransportState};
use crate::config::{ClientConfig, IceServer};
use crate::signaling::{Envelope, Frame, RoomCode};

/// Receiving end of a controller's notifications. There is exactly one.
pub type TransportEvents = async_channel::Receiver<TransportEvent>;

struct Shared<S> {
    state: TransportState,
    starting: bool,
    direct: Option<S>,
    relay: Option<mpsc::UnboundedSender<Frame>>,
    signaling: Option<mpsc::UnboundedSender<Frame>>,
    /// Dropped to stop the session driver.
    driver: Option<mpsc::UnboundedSender<()>>,
}

impl<S: DirectSession> Shared<S> {
    /// Moves to `Closed` and releases every transport. False if already closed.
    fn shutdown(&mut self) -> bool {
        if self.state == TransportState::Closed {
            return false;
        }
        self.state = TransportState::Closed;
        if let Some(mut session) = self.direct.take() {
            session.close();
        }
        if let Some(signaling) = self.signaling.take() {
            // Lets the other member hear `peer-leave` without waiting for the socket.
            if let Ok(frame) = Envelope::Leave.to_frame() {
                let _ = signaling.send(frame);
            }
        }
        self.relay = None;
        self.driver = None;
        true
    }
}

struct Inner<C: Connector, D: DirectConnector> {
    config: ClientConfig,
    connector: C,
    direct: D,
    shared: Mutex<Shared<D::Session>>,
    events: async_channel::Sender<TransportEvent>,
}

impl<C: Connector, D: DirectConnector> Inner<C, D> {
    fn lock(&self) -> MutexGuard<'_, Shared<D::Session>> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.try_send(event);
    }

    fn close(&self) {
        if self.lock().shutdown() {
            info!("Transport closed");
            self.emit(TransportEvent::Close);
        }
    }
}

/// One logical connection to the other peer.
pub struct TransportController<C: Connector, D: DirectConnector> {
    inner: Arc<Inner<C, D>>,
}

impl<C: Connector, D: DirectConnector> Clone for TransportController<C, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector, D: DirectConnector> TransportController<C, D> {
    pub fn new(config: ClientConfig, connector: C, direct: D) -> (Self, TransportEvents) {
        let (events_tx, events_rx) = async_channel::unbounded();
        let inner = Inner {
            config,
            connector,
            direct,
            shared: Mutex::new(Shared {
                state: TransportState::Idle,
                starting: false,
                direct: None,
                relay: None,
                signaling: None,
                driver: None,
            }),
            events: events_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    /// Creates or joins the room and starts negotiating.
    ///
    /// On `RoomNotFound` the controller stays `Idle` and `start` may be
    /// called again; retrying is up to the caller.
    pub async fn start(&self, role: Role) -> Result<RoomCode, ClientError> {
        {
            let mut shared = self.inner.lock();
            if shared.state != TransportState::Idle || shared.starting {
                return Err(ClientError::InvalidState(shared.state));
            }
            shared.starting = true;
        }

        let ice_servers = self.inner.config.ice_servers();
        let result = self.handshake(role).await;

        let mut shared = self.inner.lock();
        shared.starting = false;
        let (signaling, code) = result?;
        if shared.state != TransportState::Idle {
            // Closed while the handshake was in flight.
            return Err(ClientError::InvalidState(shared.state));
        }

        let (driver_tx, driver_rx) = mpsc::unbounded_channel();
        shared.state = TransportState::Negotiating;
        shared.driver = Some(driver_tx);
        shared.signaling = Some(signaling.tx.clone());
        drop(shared);
        info!("Negotiating in room {} as {:?}", code, role);

        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            inner: self.inner.clone(),
            role,
            code,
            ice_servers,
            signaling_tx: signaling.tx,
            signaling_rx: Some(signaling.rx),
            relay_rx: None,
            direct_tx,
            direct_rx,
            stop: driver_rx,
            deadline: None,
        };
        if let Role::Guest(_) = role {
            // The host is already in the room.
            driver.begin_negotiation();
        }
        tokio::spawn(driver.run());

        Ok(code)
    }

    async fn handshake(&self, role: Role) -> Result<(Channel, RoomCode), ClientError> {
        let url = &self.inner.config.signaling_url;
        let mut signaling = self.inner.connector.connect(url).await?;

        let request = match role {
            Role::Host => Envelope::Create,
            Role::Guest(code) => Envelope::Join {
                code: code.to_string(),
            },
        };
        let frame = request.to_frame().map_err(|e| ClientError::Rejected(e.to_string()))?;
        signaling
            .tx
            .send(frame)
            .map_err(|_| ClientError::SignalingClosed)?;

        while let Some(frame) = signaling.rx.recv().await {
            let Frame::Text(text) = frame else {
                continue;
            };
            match (Envelope::parse(&text), role) {
                (Some(Envelope::Created { code }), Role::Host) => return Ok((signaling, code)),
                (Some(Envelope::Joined { code }), Role::Guest(_)) => return Ok((signaling, code)),
                (Some(Envelope::Error { reason }), _) if reason == "NO_ROOM" => {
                    return Err(ClientError::RoomNotFound);
                }
                (Some(Envelope::Error { reason }), _) => return Err(ClientError::Rejected(reason)),
                (other, _) => debug!("Ignoring {:?} during handshake", other),
            }
        }
        Err(ClientError::SignalingClosed)
    }

    /// Serializes `message` as JSON and sends it on the active transport.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_frame(Frame::from(text)),
            Err(e) => {
                debug!("Dropping unserializable message: {}", e);
                false
            }
        }
    }

    /// Writes `frame` on the active transport.
    ///
    /// Without a writable active transport this is a silent no-op: nothing
    /// is queued or retried. Returns whether the frame was handed off.
    pub fn send_frame(&self, frame: Frame) -> bool {
        let mut shared = self.inner.lock();
        match shared.state {
            TransportState::Direct => match shared.direct.as_mut() {
                Some(session) if session.is_writable() => {
                    session.send(frame);
                    true
                }
                _ => false,
            },
            TransportState::Relayed => match &shared.relay {
                Some(tx) if !tx.is_closed() => tx.send(frame).is_ok(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Tears down every transport and cancels the deadline. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

enum Step {
    Stop,
    Deadline,
    Direct(DirectEvent),
    Signaling(Option<Frame>),
    Relay(Option<Frame>),
}

/// Owns one session's event sources; lives until the session closes.
struct Driver<C: Connector, D: DirectConnector> {
    inner: Arc<Inner<C, D>>,
    role: Role,
    code: RoomCode,
    ice_servers: Vec<IceServer>,
    signaling_tx: mpsc::UnboundedSender<Frame>,
    signaling_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    relay_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    direct_tx: mpsc::UnboundedSender<DirectEvent>,
    direct_rx: mpsc::UnboundedReceiver<DirectEvent>,
    stop: mpsc::UnboundedReceiver<()>,
    deadline: Option<Instant>,
}

impl<C: Connector, D: DirectConnector> Driver<C, D> {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            let step = tokio::select! {
                // Deadline first: a confirmation that is still queued when the
                // deadline is due loses, even if it was sent a moment earlier.
                biased;

                _ = self.stop.recv() => Step::Stop,
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => Step::Deadline,
                Some(event) = self.direct_rx.recv() => Step::Direct(event),
                frame = recv_or_pending(&mut self.signaling_rx) => Step::Signaling(frame),
                frame = recv_or_pending(&mut self.relay_rx) => Step::Relay(frame),
            };

            match step {
                Step::Stop => break,
                Step::Deadline => {
                    self.deadline = None;
                    self.fall_back().await;
                }
                Step::Direct(event) => self.on_direct(event),
                Step::Signaling(Some(frame)) => self.on_signaling(frame),
                Step::Signaling(None) => {
                    self.signaling_rx = None;
                    let stranded = {
                        let shared = self.inner.lock();
                        shared.state == TransportState::Negotiating && shared.direct.is_none()
                    };
                    if stranded {
                        // No negotiation and no deadline: nothing would ever end the session.
                        warn!("Signaling for {} closed before the peer arrived", self.code);
                        self.inner
                            .emit(TransportEvent::Error("signaling closed".to_string()));
                        self.inner.close();
                    } else {
                        debug!("Signaling connection for {} closed", self.code);
                    }
                }
                Step::Relay(Some(frame)) => self.on_relay(frame),
                Step::Relay(None) => {
                    info!("Relay connection for {} closed", self.code);
                    self.relay_rx = None;
                    self.inner.close();
                }
            }

            if self.inner.lock().state == TransportState::Closed {
                break;
            }
        }
        // Dropping the driver releases the deadline and every channel it holds.
        debug!("Session driver for {} stopped", self.code);
    }

    fn begin_negotiation(&mut self) {
        let mut shared = self.inner.lock();
        if shared.state != TransportState::Negotiating || shared.direct.is_some() {
            return;
        }
        let params = DirectParams {
            initiator: self.role == Role::Host,
            ice_servers: self.ice_servers.clone(),
        };
        shared.direct = Some(self.inner.direct.open(params, self.direct_tx.clone()));
        self.deadline = Some(Instant::now() + self.inner.config.fallback_deadline);
        debug!(
            "Direct negotiation started for {}, fallback in {:?}",
            self.code, self.inner.config.fallback_deadline
        );
    }

    fn on_signaling(&mut self, frame: Frame) {
        let Frame::Text(text) = frame else {
            return;
        };
        match Envelope::parse(&text) {
            Some(Envelope::PeerJoin) if self.role == Role::Host => self.begin_negotiation(),
            Some(Envelope::Signal { payload }) => {
                self.begin_negotiation();
                let mut shared = self.inner.lock();
                if let Some(session) = shared.direct.as_mut() {
                    session.signal(payload);
                }
            }
            Some(Envelope::PeerLeave) => info!("Peer left room {}", self.code),
            Some(Envelope::Error { reason }) => {
                warn!("Signaling error in room {}: {}", self.code, reason);
                self.inner.emit(TransportEvent::Error(reason));
            }
            other => debug!("Ignoring signaling frame {:?}", other),
        }
    }

    fn on_direct(&mut self, event: DirectEvent) {
        let mut shared = self.inner.lock();
        match event {
            DirectEvent::Signal(payload) => {
                if matches!(
                    shared.state,
                    TransportState::Negotiating | TransportState::Direct
                ) {
                    if let Ok(frame) = (Envelope::Signal { payload }).to_frame() {
                        let _ = self.signaling_tx.send(frame);
                    }
                }
            }
            DirectEvent::Connected => match shared.state {
                TransportState::Negotiating => {
                    shared.state = TransportState::Direct;
                    self.deadline = None;
                    drop(shared);
                    info!("Direct transport open for {}", self.code);
                    self.inner.emit(TransportEvent::Open(TransportKind::Direct));
                }
                TransportState::Relayed => {
                    debug!("Late direct confirmation for {} ignored", self.code);
                }
                _ => {}
            },
            DirectEvent::Data(frame) => {
                if shared.state == TransportState::Direct {
                    drop(shared);
                    self.inner.emit(TransportEvent::Message(frame));
                }
            }
            DirectEvent::Closed => {
                if shared.state == TransportState::Direct {
                    drop(shared);
                    info!("Direct transport for {} closed", self.code);
                    self.inner.close();
                }
            }
            DirectEvent::Error(reason) => {
                warn!("Direct session error in {}: {}", self.code, reason);
                if shared.state == TransportState::Direct {
                    drop(shared);
                    self.inner.emit(TransportEvent::Error(reason));
                }
            }
        }
    }

    /// Deadline fired: commit to the relay unless something else already won.
    async fn fall_back(&mut self) {
        {
            let mut shared = self.inner.lock();
            if shared.state != TransportState::Negotiating {
                return;
            }
            shared.state = TransportState::Relayed;
            if let Some(mut session) = shared.direct.take() {
                session.close();
            }
        }
        info!("Direct negotiation for {} timed out, using relay", self.code);

        let url = &self.inner.config.relay_url;
        let relay = match self.inner.connector.connect(url).await {
            Ok(relay) => relay,
            Err(e) => {
                warn!("Relay unavailable: {}", e);
                self.inner.emit(TransportEvent::Error(e.to_string()));
                self.inner.close();
                return;
            }
        };

        let join = Envelope::Join {
            code: self.code.to_string(),
        };
        if let Ok(frame) = join.to_frame() {
            let _ = relay.tx.send(frame);
        }

        {
            let mut shared = self.inner.lock();
            if shared.state != TransportState::Relayed {
                return;
            }
            shared.relay = Some(relay.tx);
        }
        self.relay_rx = Some(relay.rx);
        self.inner.emit(TransportEvent::Open(TransportKind::Relayed));
    }

    fn on_relay(&mut self, frame: Frame) {
        if self.inner.lock().state == TransportState::Relayed {
            self.inner.emit(TransportEvent::Message(frame));
        }
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
