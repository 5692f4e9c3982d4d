use std::marker::PhantomData;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::RoomRegistryHandle;
use super::code::CodeAllocator;
use super::handler::{FrameHandler, RelayHandler, SignalingHandler};
use super::types::{ConnId, Frame, Member};

pub const DEFAULT_SIGNALING_PORT: u16 = 9001;
pub const DEFAULT_RELAY_PORT: u16 = 9002;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket endpoint brokering frames between the members of a room.
///
/// `H` decides how frames are read; the accept loop, keep-alive and
/// registry bookkeeping are shared.
pub struct RoomServer<H: FrameHandler> {
    listener: TcpListener,
    registry: RoomRegistryHandle,
    _handler: PhantomData<fn() -> H>,
}

/// Structured control endpoint: create / join / signal.
pub type SignalingServer = RoomServer<SignalingHandler>;

/// Fallback data endpoint: join once, then opaque passthrough.
pub type RelayServer = RoomServer<RelayHandler>;

impl<H: FrameHandler> RoomServer<H> {
    /// Binds the listener; rooms hold at most `capacity` members.
    pub async fn bind(addr: &str, capacity: usize) -> std::io::Result<Self> {
        let registry =
            RoomRegistryHandle::spawn_with(capacity, CodeAllocator::new(), H::ANNOUNCE_MEMBERSHIP);
        Self::bind_with(addr, registry).await
    }

    pub async fn bind_with(addr: &str, registry: RoomRegistryHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("{} server listening on {}", H::KIND, listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            _handler: PhantomData,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection::<H>(stream, addr, registry).await {
                    error!("{} connection error from {}: {}", H::KIND, addr, e);
                }
            });
        }
    }
}

async fn handle_connection<H: FrameHandler>(
    stream: TcpStream,
    addr: SocketAddr,
    registry: RoomRegistryHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let id = ConnId::next();
    info!("{} connection {} from {}", H::KIND, id, addr);

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut handler = H::new(Member::new(id, tx), registry);
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(frame) = rx.recv() => {
                    if ws_tx.send(frame.into_message()).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("{} missed a keep-alive, dropping it", id);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                debug!("Keep-alive ping to {}", id);
            }

            _ = pong_timeout => {
                warn!("{} did not answer the keep-alive in {:?}, dropping it", id, PONG_TIMEOUT);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("{} {} read failed: {}", H::KIND, id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => handler.on_frame(Frame::Text(text)).await,
                    Message::Binary(data) => handler.on_frame(Frame::Binary(data)).await,
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("{} is alive", id);
                    }
                    Message::Close(_) => {
                        info!("{} hung up", id);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    handler.on_close().await;

    send_task.abort();
    info!("{} connection {} closed", H::KIND, id);

    Ok(())
}
