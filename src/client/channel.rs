//! Message channels to the rendezvous server.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::types::ClientError;
use crate::signaling::Frame;

/// A bidirectional frame channel.
///
/// `tx` reports closed once the underlying connection can no longer be
/// written; `rx` ends when the peer side is gone.
#[derive(Debug)]
pub struct Channel {
    pub tx: mpsc::UnboundedSender<Frame>,
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

impl Channel {
    /// Two connected in-memory ends.
    pub fn pair() -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Channel { tx: a_tx, rx: a_rx },
            Channel { tx: b_tx, rx: b_rx },
        )
    }

    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Opens channels to server endpoints.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Channel, ClientError>> + Send;
}

/// Connects over WebSocket with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Channel, ClientError> {
        let (ws_stream, _) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| ClientError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        debug!("Connected to {}", url);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        let (gone_tx, mut gone_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if ws_tx.send(frame.into_message()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut gone_rx => break,
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(data)) => Frame::Binary(data),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if in_tx.send(frame).is_err() {
                    break;
                }
            }
            let _ = gone_tx.send(());
        });

        Ok(Channel {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
