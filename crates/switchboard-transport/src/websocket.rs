//! WebSocket transport over an upgraded axum socket.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use std::net::SocketAddr;
use switchboard_protocol::CloseCode;
use tracing::{debug, warn};

use crate::traits::{Transport, TransportError};

/// A WebSocket connection.
///
/// Text and binary frames are both surfaced as text; binary payloads that
/// are not UTF-8 are converted lossily and fail to decode downstream.
pub struct WebSocketConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
}

impl WebSocketConnection {
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            socket,
            remote_addr,
            is_open: true,
        }
    }
}

#[async_trait]
impl Transport for WebSocketConnection {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if !self.is_open {
            return Ok(None);
        }

        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    let text = match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    };
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.socket.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    // Ignore pong messages
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        let frame = CloseFrame {
            code: code.code(),
            reason: code.reason().into(),
        };
        self.socket
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.ip().to_string())
    }
}
