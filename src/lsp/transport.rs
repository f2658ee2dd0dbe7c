//! Socket adapter handed to a language-server session.
//!
//! A session needs to send a text frame, wait for the next inbound event
//! (message, error or close), and dispose of the socket. Implemented for axum's
//! `WebSocket` and for an in-memory channel pair.

use crate::errors::{BridgeError, BridgeResult};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use std::io;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Error(String),
    Closed,
}

#[async_trait]
pub trait SocketTransport: Send {
    async fn send(&mut self, text: String) -> BridgeResult<()>;

    /// Resolves with the next inbound event. After `Closed` is returned the
    /// transport must not be polled again.
    async fn next_event(&mut self) -> TransportEvent;

    async fn dispose(&mut self);
}

pub struct WebSocketTransport {
    socket: WebSocket,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl SocketTransport for WebSocketTransport {
    async fn send(&mut self, text: String) -> BridgeResult<()> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| BridgeError::Io(io::Error::new(io::ErrorKind::BrokenPipe, e)))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return TransportEvent::Message(text),
                    Err(_) => return TransportEvent::Error("binary frame is not utf-8".into()),
                },
                Some(Ok(Message::Close(_))) | None => return TransportEvent::Closed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return TransportEvent::Error(e.to_string()),
            }
        }
    }

    async fn dispose(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

/// In-memory transport: frames sent by the session show up on `outbound`,
/// frames pushed into `inbound` are delivered as messages.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn pair() -> (
        Self,
        mpsc::UnboundedSender<TransportEvent>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        (Self { inbound, outbound }, inbound_tx, outbound_rx)
    }
}

#[async_trait]
impl SocketTransport for ChannelTransport {
    async fn send(&mut self, text: String) -> BridgeResult<()> {
        self.outbound.send(text).map_err(|_| {
            BridgeError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
        })
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.inbound.recv().await.unwrap_or(TransportEvent::Closed)
    }

    async fn dispose(&mut self) {
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispose_ends_the_event_stream() {
        let (mut transport, inbound_tx, mut outbound_rx) = ChannelTransport::pair();
        transport.send("hello".to_string()).await.unwrap();
        assert_eq!(outbound_rx.recv().await.as_deref(), Some("hello"));

        transport.dispose().await;
        assert!(inbound_tx.send(TransportEvent::Closed).is_err());
        assert!(matches!(transport.next_event().await, TransportEvent::Closed));
    }
}
