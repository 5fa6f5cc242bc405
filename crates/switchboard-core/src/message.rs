//! Message records.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_protocol::{DeliveryStatus, MessageType, MessageView};
use uuid::Uuid;

/// A unique message identifier. Version 7, so ids sort by creation time.
pub type MessageId = Uuid;

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    Uuid::now_v7()
}

/// Where a message goes: a room or one user, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Room(String),
    Direct(String),
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Sender label; `None` for system messages.
    pub sender: Option<String>,
    /// Originating connection.
    pub connection_id: Option<String>,
    pub destination: Destination,
    pub message_type: MessageType,
    pub content: String,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// Create a pending message.
    #[must_use]
    pub fn new(destination: Destination, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            sender: None,
            connection_id: None,
            destination,
            message_type,
            content: content.into(),
            delivery_status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
            expires_at: None,
            metadata: None,
        }
    }

    /// Create a message with a sender and originating connection.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>, connection_id: Option<String>) -> Self {
        self.sender = Some(sender.into());
        self.connection_id = connection_id;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match &self.destination {
            Destination::Room(room) => Some(room),
            Destination::Direct(_) => None,
        }
    }

    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        match &self.destination {
            Destination::Direct(user) => Some(user),
            Destination::Room(_) => None,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Wire view of this message.
    #[must_use]
    pub fn view(&self) -> MessageView {
        MessageView {
            id: self.id,
            room: self.room().map(str::to_string),
            recipient: self.recipient().map(str::to_string),
            sender: self.sender.clone(),
            message_type: self.message_type,
            content: self.content.clone(),
            delivery_status: self.delivery_status,
            created_at: self.created_at,
            delivered_at: self.delivered_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// A send request before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MessageDraft {
    /// A text message to a room.
    #[must_use]
    pub fn to_room(room: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            room: Some(room.into()),
            content: content.into(),
            ..Self::default()
        }
    }

    /// A text message to one user.
    #[must_use]
    pub fn to_user(recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Resolve the destination.
    ///
    /// # Errors
    ///
    /// Returns a validation error unless exactly one of room and recipient is set.
    pub fn destination(&self) -> Result<Destination, CoreError> {
        let room = self.room.as_deref().filter(|r| !r.is_empty());
        let recipient = self.recipient.as_deref().filter(|r| !r.is_empty());
        match (room, recipient) {
            (Some(room), None) => Ok(Destination::Room(room.to_string())),
            (None, Some(user)) => Ok(Destination::Direct(user.to_string())),
            (Some(_), Some(_)) => Err(CoreError::Validation(
                "set either room or recipient, not both".to_string(),
            )),
            (None, None) => Err(CoreError::Validation(
                "room or recipient is required".to_string(),
            )),
        }
    }
}
