//! Connection lifecycle.
//!
//! A [`ConnectionHandle`] is the shared view of one transport session. The
//! session task owns the transport; everything else (rooms, presence, admin)
//! holds the handle by connection id and talks to the session through its
//! outbox and close signal.

use crate::broker::Event;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use switchboard_admission::{ConnectionPermit, Identity};
use switchboard_protocol::CloseCode;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Connection lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Generate a connection id.
#[must_use]
pub fn generate_connection_id() -> String {
    format!("conn_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: DateTime<Utc>,
    instant: Instant,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Utc::now(),
            instant: Instant::now(),
        }
    }
}

/// Serializable snapshot of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub identity: String,
    pub anonymous: bool,
    pub state: ConnectionState,
    pub remote_addr: String,
    pub protocol: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub rooms: Vec<String>,
    pub topics: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One transport session.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: String,
    identity: Identity,
    remote_addr: String,
    protocol: String,
    metadata: serde_json::Map<String, serde_json::Value>,
    connected_at: DateTime<Utc>,
    state: AtomicU8,
    last_seen: Mutex<Activity>,
    disconnected_at: Mutex<Option<DateTime<Utc>>>,
    rooms: DashSet<String>,
    topics: DashSet<String>,
    outbox: mpsc::UnboundedSender<Event>,
    close_tx: watch::Sender<Option<CloseCode>>,
    /// Forwarding tasks per broker group.
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
    permit: Mutex<Option<ConnectionPermit>>,
}

/// Receiving ends owned by the session task.
#[derive(Debug)]
pub struct SessionChannels {
    pub outbox: mpsc::UnboundedReceiver<Event>,
    pub close: watch::Receiver<Option<CloseCode>>,
}

impl ConnectionHandle {
    /// Create a handle in the `connecting` state.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        identity: Identity,
        remote_addr: impl Into<String>,
        protocol: impl Into<String>,
    ) -> (Self, SessionChannels) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(None);

        let handle = Self {
            id: id.into(),
            identity,
            remote_addr: remote_addr.into(),
            protocol: protocol.into(),
            metadata: serde_json::Map::new(),
            connected_at: Utc::now(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_seen: Mutex::new(Activity::now()),
            disconnected_at: Mutex::new(None),
            rooms: DashSet::new(),
            topics: DashSet::new(),
            outbox: outbox_tx,
            close_tx,
            forwarders: Mutex::new(HashMap::new()),
            permit: Mutex::new(None),
        };
        let channels = SessionChannels {
            outbox: outbox_rx,
            close: close_rx,
        };
        (handle, channels)
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach the throttle permit; released when the connection closes.
    pub fn hold_permit(&self, permit: Option<ConnectionPermit>) {
        if let Ok(mut slot) = self.permit.lock() {
            *slot = permit;
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Name this connection is known by in rooms and presence.
    ///
    /// Anonymous connections are told apart by connection id.
    #[must_use]
    pub fn label(&self) -> String {
        match self.identity.user_id() {
            Some(id) => id.to_string(),
            None => format!("anonymous:{}", self.id),
        }
    }

    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move forward to `next`. Returns `false` (and changes nothing) when
    /// `next` is not after the current state.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if next as u8 <= current {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(
                        connection = %self.id,
                        from = %ConnectionState::from_u8(current),
                        to = %next,
                        "State transition"
                    );
                    if next == ConnectionState::Closed {
                        if let Ok(mut at) = self.disconnected_at.lock() {
                            *at = Some(Utc::now());
                        }
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Refresh `last_seen_at`.
    pub fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Activity::now();
        }
    }

    #[must_use]
    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen
            .lock()
            .map(|a| a.at)
            .unwrap_or(self.connected_at)
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen
            .lock()
            .map(|a| a.instant.elapsed())
            .unwrap_or_default()
    }

    /// Queue an event for the session to write. Returns `false` once the
    /// session has gone away.
    pub fn deliver(&self, event: Event) -> bool {
        self.outbox.send(event).is_ok()
    }

    /// Ask the session to close with `code`.
    ///
    /// Only the first request wins; later requests and requests against a
    /// connection that is already closing are ignored.
    pub fn request_close(&self, code: CloseCode) -> bool {
        if !self.transition(ConnectionState::Closing) {
            return false;
        }
        debug!(connection = %self.id, code = code.code(), "Close requested");
        self.close_tx.send_replace(Some(code));
        true
    }

    pub(crate) fn rooms_set(&self) -> &DashSet<String> {
        &self.rooms
    }

    pub(crate) fn topics_set(&self) -> &DashSet<String> {
        &self.topics
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.iter().map(|r| r.clone()).collect();
        rooms.sort();
        rooms
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|t| t.clone()).collect();
        topics.sort();
        topics
    }

    #[must_use]
    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.contains(room)
    }

    /// Spawn a task forwarding a broker stream into the outbox.
    pub(crate) fn attach_forwarder(
        &self,
        group: &str,
        mut rx: tokio::sync::broadcast::Receiver<Event>,
    ) {
        let outbox = self.outbox.clone();
        let connection_id = self.id.clone();
        let group_name = group.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if outbox.send(event).is_err() {
                            break; // Session gone
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(
                            connection = %connection_id,
                            group = %group_name,
                            skipped,
                            "Forwarder lagged"
                        );
                    }
                }
            }
        });

        if let Ok(mut forwarders) = self.forwarders.lock() {
            if let Some(previous) = forwarders.insert(group.to_string(), handle) {
                previous.abort();
            }
        }
    }

    pub(crate) fn detach_forwarder(&self, group: &str) {
        if let Ok(mut forwarders) = self.forwarders.lock() {
            if let Some(handle) = forwarders.remove(group) {
                handle.abort();
            }
        }
    }

    /// Abort every forwarder and release the throttle permit.
    pub(crate) fn release(&self) {
        if let Ok(mut forwarders) = self.forwarders.lock() {
            for (_, handle) in forwarders.drain() {
                handle.abort();
            }
        }
        if let Ok(mut permit) = self.permit.lock() {
            permit.take();
        }
    }

    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id.clone(),
            identity: self.label(),
            anonymous: self.identity.is_anonymous(),
            state: self.state(),
            remote_addr: self.remote_addr.clone(),
            protocol: self.protocol.clone(),
            connected_at: self.connected_at,
            last_seen_at: self.last_seen_at(),
            disconnected_at: self.disconnected_at.lock().ok().and_then(|at| *at),
            rooms: self.rooms(),
            topics: self.topics(),
            metadata: self.metadata.clone(),
        }
    }
}
