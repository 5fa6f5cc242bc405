//! Persistence capability.
//!
//! Message and room records go through [`Store`]. Presence and connection
//! records live only in memory, in their trackers.

use crate::error::CoreError;
use crate::message::{Destination, Message, MessageId};
use crate::room::Room;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use switchboard_protocol::DeliveryStatus;
use thiserror::Error;
use tracing::trace;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CoreError::NotFound(what),
            StoreError::Unavailable(why) => CoreError::StoreUnavailable(why),
        }
    }
}

/// A page of room history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    /// Only messages created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
}

/// Persistence for message and room records.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Set a message's delivery status; `delivered_at` is stamped on delivery.
    async fn set_status(
        &self,
        id: MessageId,
        status: DeliveryStatus,
    ) -> Result<Message, StoreError>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Room messages, newest first, excluding expired ones.
    async fn room_history(&self, room: &str, query: HistoryQuery)
        -> Result<Vec<Message>, StoreError>;

    /// Delete messages created before `cutoff`; `room = None` selects direct messages.
    async fn delete_before(
        &self,
        room: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Mark every pending message whose expiry has passed as expired.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Rooms that have at least one stored message.
    async fn message_rooms(&self) -> Result<Vec<String>, StoreError>;

    async fn save_room(&self, room: &Room) -> Result<(), StoreError>;

    async fn load_rooms(&self) -> Result<Vec<Room>, StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<MessageId, Message>,
    rooms: DashMap<String, Room>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages.insert(message.id, message.clone());
        trace!(message = %message.id, "Message stored");
        Ok(())
    }

    async fn set_status(
        &self,
        id: MessageId,
        status: DeliveryStatus,
    ) -> Result<Message, StoreError> {
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        message.delivery_status = status;
        if status == DeliveryStatus::Delivered && message.delivered_at.is_none() {
            message.delivered_at = Some(Utc::now());
        }
        Ok(message.clone())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn room_history(
        &self,
        room: &str,
        query: HistoryQuery,
    ) -> Result<Vec<Message>, StoreError> {
        let mut page: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.room() == Some(room))
            .filter(|m| m.delivery_status != DeliveryStatus::Expired)
            .filter(|m| query.before.map_or(true, |before| m.created_at < before))
            .map(|m| m.clone())
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        page.truncate(query.limit);
        Ok(page)
    }

    async fn delete_before(
        &self,
        room: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let before = self.messages.len();
        self.messages.retain(|_, m| {
            let selected = match (&m.destination, room) {
                (Destination::Room(r), Some(room)) => r == room,
                (Destination::Direct(_), None) => true,
                _ => false,
            };
            !(selected && m.created_at < cutoff)
        });
        Ok(before.saturating_sub(self.messages.len()))
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut expired = 0;
        for mut entry in self.messages.iter_mut() {
            if entry.delivery_status == DeliveryStatus::Pending && entry.is_expired(now) {
                entry.delivery_status = DeliveryStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn message_rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut rooms: Vec<String> = self
            .messages
            .iter()
            .filter_map(|m| m.room().map(str::to_string))
            .collect();
        rooms.sort();
        rooms.dedup();
        Ok(rooms)
    }

    async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        self.rooms.insert(room.name.clone(), room.clone());
        Ok(())
    }

    async fn load_rooms(&self) -> Result<Vec<Room>, StoreError> {
        Ok(self.rooms.iter().map(|r| r.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use switchboard_protocol::MessageType;

    fn room_message(room: &str, content: &str) -> Message {
        Message::new(Destination::Room(room.into()), MessageType::Text, content)
    }

    #[tokio::test]
    async fn test_history_newest_first_with_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert_message(&room_message("general", &format!("m{}", i)))
                .await
                .unwrap();
        }
        store.insert_message(&room_message("other", "x")).await.unwrap();

        let page = store
            .room_history("general", HistoryQuery { limit: 3, before: None })
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn test_history_before_cursor() {
        let store = MemoryStore::new();
        let mut old = room_message("general", "old");
        old.created_at = Utc::now() - ChronoDuration::hours(2);
        store.insert_message(&old).await.unwrap();
        store.insert_message(&room_message("general", "new")).await.unwrap();

        let page = store
            .room_history(
                "general",
                HistoryQuery {
                    limit: 10,
                    before: Some(Utc::now() - ChronoDuration::hours(1)),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "old");
    }

    #[tokio::test]
    async fn test_set_status_stamps_delivery() {
        let store = MemoryStore::new();
        let msg = room_message("general", "hi");
        store.insert_message(&msg).await.unwrap();

        let delivered = store.set_status(msg.id, DeliveryStatus::Delivered).await.unwrap();
        assert!(delivered.delivered_at.is_some());

        let missing = store.set_status(generate_id(), DeliveryStatus::Failed).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    fn generate_id() -> MessageId {
        crate::message::generate_message_id()
    }

    #[tokio::test]
    async fn test_delete_before_scopes_by_destination() {
        let store = MemoryStore::new();
        let past = Utc::now() - ChronoDuration::days(10);
        for dest in [
            Destination::Room("a".into()),
            Destination::Room("b".into()),
            Destination::Direct("bob".into()),
        ] {
            let mut m = Message::new(dest, MessageType::Text, "x");
            m.created_at = past;
            store.insert_message(&m).await.unwrap();
        }

        let cutoff = Utc::now() - ChronoDuration::days(7);
        assert_eq!(store.delete_before(Some("a"), cutoff).await.unwrap(), 1);
        assert_eq!(store.delete_before(None, cutoff).await.unwrap(), 1);
        assert_eq!(store.message_rooms().await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_messages_leave_history() {
        let store = MemoryStore::new();
        let msg = room_message("general", "soon gone")
            .with_expiry(Some(Utc::now() - ChronoDuration::seconds(1)));
        store.insert_message(&msg).await.unwrap();

        assert_eq!(store.expire_due(Utc::now()).await.unwrap(), 1);
        let page = store
            .room_history("general", HistoryQuery { limit: 10, before: None })
            .await
            .unwrap();
        assert!(page.is_empty());
    }
}
