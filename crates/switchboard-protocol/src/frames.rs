//! Frame types for the Switchboard protocol.
//!
//! Inbound frames are what clients send; outbound frames are server events.
//! Both are internally tagged on `type`, so adding a frame kind is a change to
//! a closed enum and every dispatcher match has to account for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of content carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Json,
    Binary,
    System,
    Presence,
    Typing,
}

/// Delivery status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
    Expired,
}

/// Presence status of an identity in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

/// Names of every inbound frame type, used to tell unknown types apart from
/// malformed known ones.
pub const INBOUND_TYPES: &[&str] = &[
    "room.join",
    "room.leave",
    "message.send",
    "typing.start",
    "typing.stop",
    "presence.update",
    "subscribe",
    "unsubscribe",
    "ping",
];

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    /// Join a room.
    #[serde(rename = "room.join")]
    RoomJoin { room: String },

    /// Leave a room.
    #[serde(rename = "room.leave")]
    RoomLeave { room: String },

    /// Send a message to a room or directly to one recipient.
    #[serde(rename = "message.send")]
    MessageSend {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_type: Option<MessageType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },

    /// Start typing in a room.
    #[serde(rename = "typing.start")]
    TypingStart { room: String },

    /// Stop typing in a room.
    #[serde(rename = "typing.stop")]
    TypingStop { room: String },

    /// Change the sender's presence in every joined room.
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },

    /// Subscribe to an event topic (trailing `*` matches a prefix).
    #[serde(rename = "subscribe")]
    Subscribe { event_type: String },

    /// Unsubscribe from an event topic.
    #[serde(rename = "unsubscribe")]
    Unsubscribe { event_type: String },

    /// Keepalive.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl InboundFrame {
    /// The wire name of this frame's type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundFrame::RoomJoin { .. } => "room.join",
            InboundFrame::RoomLeave { .. } => "room.leave",
            InboundFrame::MessageSend { .. } => "message.send",
            InboundFrame::TypingStart { .. } => "typing.start",
            InboundFrame::TypingStop { .. } => "typing.stop",
            InboundFrame::PresenceUpdate { .. } => "presence.update",
            InboundFrame::Subscribe { .. } => "subscribe",
            InboundFrame::Unsubscribe { .. } => "unsubscribe",
            InboundFrame::Ping { .. } => "ping",
        }
    }

    /// The room a frame targets, if any.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match self {
            InboundFrame::RoomJoin { room }
            | InboundFrame::RoomLeave { room }
            | InboundFrame::TypingStart { room }
            | InboundFrame::TypingStop { room } => Some(room),
            InboundFrame::MessageSend { room, .. } => room.as_deref(),
            _ => None,
        }
    }

    /// Create a room.join frame.
    #[must_use]
    pub fn join(room: impl Into<String>) -> Self {
        InboundFrame::RoomJoin { room: room.into() }
    }

    /// Create a text message.send frame addressed to a room.
    #[must_use]
    pub fn send_to_room(room: impl Into<String>, content: impl Into<String>) -> Self {
        InboundFrame::MessageSend {
            room: Some(room.into()),
            recipient: None,
            content: content.into(),
            message_type: None,
            metadata: None,
        }
    }
}

/// Wire view of a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// `None` for system messages.
    pub sender: Option<String>,
    pub message_type: MessageType,
    pub content: String,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One identity's presence as shown to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub identity: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// Body of an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    /// Sent once after admission succeeds.
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        connection_id: String,
        identity: String,
        version: String,
    },

    /// Acknowledges a successful join.
    #[serde(rename = "room.joined")]
    RoomJoined {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        history: Option<Vec<MessageView>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        presence: Option<Vec<PresenceEntry>>,
    },

    /// Acknowledges a leave.
    #[serde(rename = "room.left")]
    RoomLeft { room: String },

    /// Another identity joined a room.
    #[serde(rename = "user.joined")]
    UserJoined { room: String, identity: String },

    /// Another identity left a room.
    #[serde(rename = "user.left")]
    UserLeft { room: String, identity: String },

    /// A new message was delivered.
    #[serde(rename = "message.new")]
    MessageNew { message: MessageView },

    #[serde(rename = "typing.start")]
    TypingStart { room: String, identity: String },

    #[serde(rename = "typing.stop")]
    TypingStop { room: String, identity: String },

    /// Presence change in a room. Never carries connection counts.
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        room: String,
        identity: String,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },

    /// Acknowledges an event-topic subscription.
    #[serde(rename = "subscribed")]
    Subscribed { event_type: String },

    /// Acknowledges an event-topic unsubscription.
    #[serde(rename = "unsubscribed")]
    Unsubscribed { event_type: String },

    /// An event published on a topic the connection subscribed to.
    #[serde(rename = "event")]
    Event {
        event_type: String,
        data: serde_json::Value,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A request failed; the connection stays open.
    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

impl OutboundFrame {
    /// Create an error frame.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    /// The wire name of this frame's type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundFrame::ConnectionEstablished { .. } => "connection.established",
            OutboundFrame::RoomJoined { .. } => "room.joined",
            OutboundFrame::RoomLeft { .. } => "room.left",
            OutboundFrame::UserJoined { .. } => "user.joined",
            OutboundFrame::UserLeft { .. } => "user.left",
            OutboundFrame::MessageNew { .. } => "message.new",
            OutboundFrame::TypingStart { .. } => "typing.start",
            OutboundFrame::TypingStop { .. } => "typing.stop",
            OutboundFrame::PresenceUpdate { .. } => "presence.update",
            OutboundFrame::Subscribed { .. } => "subscribed",
            OutboundFrame::Unsubscribed { .. } => "unsubscribed",
            OutboundFrame::Event { .. } => "event",
            OutboundFrame::Pong { .. } => "pong",
            OutboundFrame::Error { .. } => "error",
        }
    }
}
