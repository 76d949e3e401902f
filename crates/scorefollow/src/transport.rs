//! Connection halves used by sessions.
//!
//! A session reads control messages from a [`MessageSource`] and writes
//! [`ServerMessage`]s to a [`MessageSink`]. The two halves are driven from
//! different branches of the same task, so each half is owned separately.

use crate::protocol::ServerMessage;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("transport failure: {0}")]
    Io(String),
}

/// Inbound half of a client connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next JSON message.
    async fn recv_json(&mut self) -> Result<serde_json::Value, TransportError>;
}

/// Outbound half of a client connection.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), TransportError>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&mut self);

    /// False once the sink was closed or a send failed.
    fn is_open(&self) -> bool;
}

/// Split an upgraded WebSocket into session halves.
pub fn split_websocket(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource { inner: stream }, WsSink { inner: sink, open: true })
}

pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn recv_json(&mut self) -> Result<serde_json::Value, TransportError> {
        loop {
            let msg = match self.inner.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(msg)) => msg,
            };

            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| TransportError::Malformed(e.to_string()));
                }
                Message::Binary(bytes) => {
                    return serde_json::from_slice(&bytes)
                        .map_err(|e| TransportError::Malformed(e.to_string()));
                }
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
    open: bool,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        let text = serde_json::to_string(message)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        if let Err(e) = self.inner.send(Message::Text(text.into())).await {
            self.open = false;
            return Err(TransportError::Io(e.to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.inner.close().await {
                tracing::debug!("websocket close failed: {}", e);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// In-memory connection for tests and embedding without a socket.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// Create a connected (source, sink, client) triple.
    pub fn pair() -> (MemorySource, MemorySink, ClientEnd) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();

        (
            MemorySource { inbound },
            MemorySink {
                outbound: Some(outbound),
                closes: 0,
            },
            ClientEnd {
                to_server: Some(to_server),
                from_server,
            },
        )
    }

    pub struct MemorySource {
        inbound: mpsc::UnboundedReceiver<Result<serde_json::Value, TransportError>>,
    }

    #[async_trait]
    impl MessageSource for MemorySource {
        async fn recv_json(&mut self) -> Result<serde_json::Value, TransportError> {
            self.inbound.recv().await.unwrap_or(Err(TransportError::Closed))
        }
    }

    pub struct MemorySink {
        outbound: Option<mpsc::UnboundedSender<ServerMessage>>,
        closes: usize,
    }

    impl MemorySink {
        /// Number of times `close` actually closed the sink.
        pub fn close_count(&self) -> usize {
            self.closes
        }
    }

    #[async_trait]
    impl MessageSink for MemorySink {
        async fn send(&mut self, message: &ServerMessage) -> Result<(), TransportError> {
            let tx = self.outbound.as_ref().ok_or(TransportError::Closed)?;
            if tx.send(message.clone()).is_err() {
                self.outbound = None;
                return Err(TransportError::Closed);
            }
            Ok(())
        }

        async fn close(&mut self) {
            if self.outbound.take().is_some() {
                self.closes += 1;
            }
        }

        fn is_open(&self) -> bool {
            self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
        }
    }

    /// The client's side of an in-memory connection.
    pub struct ClientEnd {
        to_server: Option<mpsc::UnboundedSender<Result<serde_json::Value, TransportError>>>,
        from_server: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl ClientEnd {
        /// Send a JSON message. Returns false once hung up.
        pub fn send_json(&self, value: serde_json::Value) -> bool {
            self.to_server
                .as_ref()
                .is_some_and(|tx| tx.send(Ok(value)).is_ok())
        }

        /// Deliver a receive failure to the server.
        pub fn send_error(&self, error: TransportError) -> bool {
            self.to_server
                .as_ref()
                .is_some_and(|tx| tx.send(Err(error)).is_ok())
        }

        pub fn stop(&self) -> bool {
            self.send_json(serde_json::json!({ "action": "stop" }))
        }

        /// Stop sending; the server observes a closed connection.
        pub fn hang_up(&mut self) {
            self.to_server = None;
        }

        /// Next message from the server, or None once the server closed.
        pub async fn recv(&mut self) -> Option<ServerMessage> {
            self.from_server.recv().await
        }

        /// Collect everything the server sends until it closes.
        pub async fn drain(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Some(msg) = self.from_server.recv().await {
                messages.push(msg);
            }
            messages
        }
    }
}
