//! Transport layer for the CDP connection.
//!
//! The connection treats the transport as an abstract ordered duplex message
//! channel: one JSON value out per [`Transport::send`], one JSON value in per
//! element on the inbound message channel. Framing belongs to the transport.
//!
//! [`WebSocketTransport`] speaks to a real browser DevTools endpoint;
//! [`loopback`] provides an in-memory pair for tests and embedding.

use crate::error::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Outbound half of a transport.
pub trait Transport: Send {
    /// Sends one message to the remote endpoint.
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Inbound half of a transport.
///
/// `run` reads messages from the remote endpoint and feeds them into the
/// message channel until the stream ends or fails.
pub trait TransportReceiver: Send {
    /// Drives the read loop to completion.
    fn run(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// The pieces a [`crate::Connection`] needs from a transport.
pub struct TransportParts {
    /// Outbound half, driven by the connection's writer task.
    pub sender: Box<dyn Transport>,
    /// Inbound half, driven by the connection's reader task.
    pub receiver: Box<dyn TransportReceiver>,
    /// Channel delivering inbound messages in arrival order.
    pub message_rx: mpsc::UnboundedReceiver<Value>,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket transport to a browser DevTools endpoint.
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Connects to a DevTools WebSocket URL (`ws://host:port/devtools/...`).
    pub async fn connect(url: &str) -> Result<TransportParts> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = ws.split();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Ok(TransportParts {
            sender: Box::new(WebSocketSender { sink }),
            receiver: Box::new(WebSocketReceiver { stream, message_tx }),
            message_rx,
        })
    }
}

/// Outbound WebSocket half: one text frame per envelope.
pub struct WebSocketSender {
    sink: WsSink,
}

impl Transport for WebSocketSender {
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let text = serde_json::to_string(&message)?;
            self.sink
                .send(WsMessage::Text(text))
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        })
    }
}

/// Inbound WebSocket half: parses text frames into JSON values.
pub struct WebSocketReceiver {
    stream: WsStream,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl TransportReceiver for WebSocketReceiver {
    fn run(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            while let Some(frame) = self.stream.next().await {
                let frame = frame.map_err(|e| Error::Transport(e.to_string()))?;
                match frame {
                    WsMessage::Text(text) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if self.message_tx.send(value).is_err() {
                                // Connection dropped its receiver; stop reading.
                                break;
                            }
                        }
                        // One unparseable frame must not tear down the stream.
                        Err(e) => tracing::error!("failed to parse inbound frame: {e}"),
                    },
                    WsMessage::Binary(_) => {
                        tracing::debug!("ignoring unexpected binary frame");
                    }
                    WsMessage::Close(_) => break,
                    // Ping/pong are answered by tungstenite itself.
                    _ => {}
                }
            }
            Ok(())
        })
    }
}

/// Test-side handle for a [`loopback`] transport.
///
/// `outbound` yields envelopes the connection wrote; `deliver` injects
/// inbound envelopes. Dropping the peer closes the transport, which the
/// connection observes as stream end.
pub struct LoopbackPeer {
    outbound_rx: mpsc::UnboundedReceiver<Value>,
    inbound_tx: mpsc::UnboundedSender<Value>,
    _closed_tx: oneshot::Sender<()>,
}

impl LoopbackPeer {
    /// Injects an inbound message, as if the remote endpoint sent it.
    pub fn deliver(&self, message: Value) {
        let _ = self.inbound_tx.send(message);
    }

    /// Waits for the next envelope written by the connection.
    pub async fn written(&mut self) -> Option<Value> {
        self.outbound_rx.recv().await
    }

    /// Returns the next written envelope if one is already queued.
    pub fn try_written(&mut self) -> Option<Value> {
        self.outbound_rx.try_recv().ok()
    }
}

struct LoopbackSender {
    outbound_tx: mpsc::UnboundedSender<Value>,
}

impl Transport for LoopbackSender {
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let sent = self.outbound_tx.send(message);
        Box::pin(async move {
            sent.map_err(|_| Error::Transport("loopback peer hung up".to_string()))
        })
    }
}

struct LoopbackReceiver {
    closed_rx: oneshot::Receiver<()>,
}

impl TransportReceiver for LoopbackReceiver {
    fn run(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            // Inbound messages flow straight from the peer into message_rx;
            // the read task only waits for the peer to hang up.
            let _ = (&mut self.closed_rx).await;
            Ok(())
        })
    }
}

/// Creates an in-memory transport and the peer handle driving it.
pub fn loopback() -> (TransportParts, LoopbackPeer) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, message_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = oneshot::channel();

    let parts = TransportParts {
        sender: Box::new(LoopbackSender { outbound_tx }),
        receiver: Box::new(LoopbackReceiver { closed_rx }),
        message_rx,
    };
    let peer = LoopbackPeer {
        outbound_rx,
        inbound_tx,
        _closed_tx: closed_tx,
    };
    (parts, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let (mut parts, mut peer) = loopback();

        parts
            .sender
            .send(json!({"id": 1, "method": "Target.getTargets"}))
            .await
            .unwrap();
        let written = peer.written().await.unwrap();
        assert_eq!(written["method"], "Target.getTargets");

        peer.deliver(json!({"id": 1, "result": {}}));
        let inbound = parts.message_rx.recv().await.unwrap();
        assert_eq!(inbound["id"], 1);
    }

    #[tokio::test]
    async fn test_loopback_drop_closes_both_directions() {
        let (mut parts, peer) = loopback();
        drop(peer);

        assert!(parts.sender.send(json!({"id": 1})).await.is_err());
        assert!(parts.message_rx.recv().await.is_none());
        // Reader observes the hang-up and returns cleanly.
        parts.receiver.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_preserves_order() {
        let (mut parts, peer) = loopback();

        for i in 0..5 {
            peer.deliver(json!({"id": i}));
        }
        for i in 0..5 {
            assert_eq!(parts.message_rx.recv().await.unwrap()["id"], i);
        }
    }
}
