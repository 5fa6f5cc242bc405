//! Transport abstraction traits for Switchboard.
//!
//! A [`Transport`] is one already-upgraded client connection. Sessions only
//! see text frames in, encoded frames out and a close code at the end, so the
//! same session logic runs over WebSocket and over the in-memory transport
//! used by tests.

use async_trait::async_trait;
use switchboard_protocol::{codec, CloseCode, OutboundFrame, ProtocolError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A single bidirectional client connection.
#[async_trait]
pub trait Transport: Send {
    /// Transport name for logs ("websocket", "memory").
    fn name(&self) -> &'static str;

    /// Receive the next text frame.
    ///
    /// Returns `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send pre-encoded frame text.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Encode and send a frame.
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let text = codec::encode(frame)?;
        self.send_text(text).await
    }

    /// Close the connection with a stable close code.
    ///
    /// Closing an already-closed transport is not an error.
    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError>;

    /// Remote address of the peer, if known.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
