//! The per-connection session task.
//!
//! One task owns the transport. It is the only writer, so replies, fan-out
//! events and the final close frame leave in a single ordered stream. Inbound
//! frames are processed strictly in arrival order.

use crate::connection::{ConnectionHandle, ConnectionState, SessionChannels};
use crate::error::CoreError;
use crate::hub::Hub;
use crate::metrics::{self, ConnectionMetricsGuard};
use std::sync::Arc;
use std::time::Instant;
use switchboard_admission::FrameContext;
use switchboard_protocol::{codec, CloseCode, OutboundFrame, PROTOCOL_VERSION};
use switchboard_transport::Transport;
use tracing::{debug, info, warn};

/// How the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// We close with this code.
    Close(CloseCode),
    /// The peer closed or the transport failed; nothing left to write.
    PeerGone,
}

enum Step {
    Continue,
    Exit(Exit),
}

pub(crate) struct Session<T: Transport> {
    hub: Hub,
    transport: T,
    conn: Arc<ConnectionHandle>,
    channels: SessionChannels,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        hub: Hub,
        transport: T,
        conn: Arc<ConnectionHandle>,
        channels: SessionChannels,
    ) -> Self {
        Self {
            hub,
            transport,
            conn,
            channels,
        }
    }

    /// Run until the connection closes. Returns the close code we sent, if any.
    pub(crate) async fn run(mut self, events: Vec<String>) -> Option<CloseCode> {
        let _metrics = ConnectionMetricsGuard::new();

        let established = OutboundFrame::ConnectionEstablished {
            connection_id: self.conn.id().to_string(),
            identity: self.conn.label(),
            version: PROTOCOL_VERSION.to_string(),
        };
        let exit = if self.write(&established).await {
            self.subscribe_handshake_topics(events).await;
            self.read_loop().await
        } else {
            Exit::PeerGone
        };

        self.teardown(exit).await
    }

    async fn subscribe_handshake_topics(&mut self, events: Vec<String>) {
        let registry = Arc::clone(self.hub.registry());
        for pattern in events {
            match registry.subscribe_topic(&self.conn, &pattern).await {
                Ok(_) => {
                    let ack = OutboundFrame::Subscribed {
                        event_type: pattern,
                    };
                    self.write(&ack).await;
                }
                Err(e) => self.write_error(&e).await,
            }
        }
    }

    async fn read_loop(&mut self) -> Exit {
        loop {
            tokio::select! {
                biased;

                changed = self.channels.close.changed() => {
                    let requested = *self.channels.close.borrow();
                    match (changed, requested) {
                        (_, Some(code)) => return Exit::Close(code),
                        (Err(_), None) => return Exit::Close(CloseCode::GoingAway),
                        (Ok(()), None) => {}
                    }
                }

                event = self.channels.outbox.recv() => {
                    let Some(event) = event else {
                        return Exit::Close(CloseCode::GoingAway);
                    };
                    if !self.write(&event).await {
                        return Exit::PeerGone;
                    }
                }

                inbound = self.transport.recv() => {
                    match inbound {
                        Ok(Some(text)) => {
                            if let Step::Exit(exit) = self.handle_inbound(text).await {
                                return exit;
                            }
                        }
                        Ok(None) => {
                            debug!(connection = %self.conn.id(), "Peer closed");
                            return Exit::PeerGone;
                        }
                        Err(e) => {
                            debug!(connection = %self.conn.id(), error = %e, "Receive failed");
                            return Exit::PeerGone;
                        }
                    }
                }
            }
        }
    }

    async fn handle_inbound(&mut self, text: String) -> Step {
        self.conn.touch();
        metrics::record_frame(text.len(), "inbound");

        let mut ctx = FrameContext::new(
            self.conn.identity().clone(),
            self.conn.remote_addr(),
            self.conn.id(),
            text,
        );
        if let Err(rejection) = self.hub.frame_pipeline().run(&mut ctx).await {
            metrics::record_rejection(rejection.stage, rejection.code.code());
            info!(
                connection = %self.conn.id(),
                stage = rejection.stage,
                code = rejection.code.code(),
                "Frame rejected"
            );
            return Step::Exit(Exit::Close(rejection.code));
        }

        let frame = match ctx.take_decoded() {
            Ok(frame) => frame,
            Err(e) => {
                self.write_error(&CoreError::from(e)).await;
                return Step::Continue;
            }
        };

        let started = Instant::now();
        let result = self.hub.dispatcher().dispatch(&self.conn, frame).await;
        metrics::record_dispatch(started.elapsed().as_secs_f64());

        match result {
            Ok(Some(reply)) => {
                if !self.write(&reply).await {
                    return Step::Exit(Exit::PeerGone);
                }
            }
            Ok(None) => {}
            Err(e) => self.write_error(&e).await,
        }
        Step::Continue
    }

    async fn write(&mut self, frame: &OutboundFrame) -> bool {
        let text = match codec::encode(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(connection = %self.conn.id(), frame = frame.type_name(), error = %e, "Encode failed");
                return true;
            }
        };
        let bytes = text.len();
        match self.transport.send_text(text).await {
            Ok(()) => {
                metrics::record_frame(bytes, "outbound");
                true
            }
            Err(e) => {
                debug!(connection = %self.conn.id(), error = %e, "Send failed");
                false
            }
        }
    }

    async fn write_error(&mut self, error: &CoreError) {
        metrics::record_error(error.code());
        debug!(connection = %self.conn.id(), code = error.code(), error = %error, "Request failed");
        self.write(&error.to_frame()).await;
    }

    /// `closing`: leave rooms, flush what is queued within the flush timeout,
    /// close the transport, then deregister (`closed`).
    async fn teardown(mut self, exit: Exit) -> Option<CloseCode> {
        self.conn.transition(ConnectionState::Closing);
        self.hub.rooms().leave_all(&self.conn).await;

        let sent = match exit {
            Exit::Close(code) => {
                let flush_timeout = self.hub.config().sessions.flush_timeout();
                if tokio::time::timeout(flush_timeout, self.flush()).await.is_err() {
                    warn!(connection = %self.conn.id(), "Flush timed out");
                }
                if let Err(e) = self.transport.close(code).await {
                    debug!(connection = %self.conn.id(), error = %e, "Close failed");
                }
                Some(code)
            }
            Exit::PeerGone => {
                let _ = self.transport.close(CloseCode::Normal).await;
                None
            }
        };

        self.hub.registry().deregister(&self.conn).await;
        info!(
            connection = %self.conn.id(),
            code = ?sent.map(CloseCode::code),
            "Connection closed"
        );
        sent
    }

    async fn flush(&mut self) {
        while let Ok(event) = self.channels.outbox.try_recv() {
            if !self.write(&event).await {
                break;
            }
        }
    }
}
