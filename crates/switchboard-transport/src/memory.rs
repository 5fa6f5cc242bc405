//! In-process transport.
//!
//! [`memory_pair`] returns the server half, which implements [`Transport`],
//! and a [`MemoryClient`] that plays the remote peer. Integration tests and
//! benchmarks drive full sessions through it without sockets.

use async_trait::async_trait;
use switchboard_protocol::{codec, CloseCode, InboundFrame, OutboundFrame, ProtocolError};
use tokio::sync::mpsc;

use crate::traits::{Transport, TransportError};

/// What the client observes from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Encoded frame text.
    Frame(String),
    /// The server closed the connection.
    Closed(CloseCode),
}

/// Create a connected transport/client pair.
#[must_use]
pub fn memory_pair(remote_addr: impl Into<String>) -> (MemoryTransport, MemoryClient) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    (
        MemoryTransport {
            inbound: server_rx,
            outbound: server_tx,
            remote_addr: remote_addr.into(),
            closed: false,
        },
        MemoryClient {
            outbound: Some(client_tx),
            inbound: client_rx,
        },
    )
}

/// Server half of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    remote_addr: String,
    closed: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.inbound.recv().await)
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(ClientEvent::Frame(text))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        // The client may already be gone.
        let _ = self.outbound.send(ClientEvent::Closed(code));
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.clone())
    }
}

/// Client half of an in-memory connection.
#[derive(Debug)]
pub struct MemoryClient {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<ClientEvent>,
}

impl MemoryClient {
    /// Send raw frame text.
    ///
    /// # Errors
    ///
    /// Returns an error once the server half is dropped or the client hung up.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(text.into())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Encode and send a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is gone.
    pub fn send(&self, frame: &InboundFrame) -> Result<(), TransportError> {
        self.send_text(codec::encode_inbound(frame)?)
    }

    /// Hang up: the server's next `recv` returns `None`.
    pub fn hang_up(&mut self) {
        self.outbound = None;
    }

    /// Next event from the server, or `None` once the server half is gone.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.inbound.recv().await
    }

    /// Next decoded frame, or the close code if the server closed instead.
    ///
    /// # Errors
    ///
    /// Returns `Err(Some(code))` on close, `Err(None)` when the server half is
    /// gone without a close.
    pub async fn next_frame(&mut self) -> Result<OutboundFrame, Option<CloseCode>> {
        match self.inbound.recv().await {
            Some(ClientEvent::Frame(text)) => {
                codec::decode_outbound(&text).map_err(|_: ProtocolError| None)
            }
            Some(ClientEvent::Closed(code)) => Err(Some(code)),
            None => Err(None),
        }
    }

    /// Skip frames until one satisfies `pred`.
    ///
    /// # Errors
    ///
    /// Same as [`MemoryClient::next_frame`].
    pub async fn next_matching<F>(&mut self, mut pred: F) -> Result<OutboundFrame, Option<CloseCode>>
    where
        F: FnMut(&OutboundFrame) -> bool,
    {
        loop {
            let frame = self.next_frame().await?;
            if pred(&frame) {
                return Ok(frame);
            }
        }
    }

    /// Wait for the server to close, discarding frames.
    pub async fn closed(&mut self) -> Option<CloseCode> {
        while let Some(event) = self.inbound.recv().await {
            if let ClientEvent::Closed(code) = event {
                return Some(code);
            }
        }
        None
    }
}
