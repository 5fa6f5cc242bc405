//! Administrative operations.
//!
//! Used by the server's admin routes. None of these go through admission
//! control; callers are trusted.

use crate::connection::ConnectionInfo;
use crate::error::CoreError;
use crate::hub::Hub;
use crate::message::Message;
use crate::presence::PresenceRecord;
use crate::registry::{topic_matches, ConnectionFilter};
use crate::room::{Room, RoomSpec, RoomUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchboard_protocol::{CloseCode, OutboundFrame};
use tracing::{info, warn};

/// Broadcast a system message to rooms and users.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadcastRequest {
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Per-target outcome of a broadcast.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastReport {
    /// Stored messages; direct messages to offline users stay pending.
    pub sent: Vec<Message>,
    /// Target and error message for every failed target.
    pub failed: Vec<(String, String)>,
}

impl Hub {
    /// Connections matching `filter`, oldest first.
    #[must_use]
    pub fn list_connections(&self, filter: &ConnectionFilter) -> Vec<ConnectionInfo> {
        self.registry().list(filter)
    }

    /// Close a connection with the force-disconnect code.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] when the connection is unknown or already closing.
    pub fn force_disconnect(&self, connection_id: &str) -> Result<(), CoreError> {
        if self
            .registry()
            .close(connection_id, CloseCode::ForceDisconnected)
        {
            info!(connection = %connection_id, "Force-disconnected");
            Ok(())
        } else {
            Err(CoreError::NotFound(format!("connection {}", connection_id)))
        }
    }

    #[must_use]
    pub fn list_rooms(&self, include_inactive: bool) -> Vec<Room> {
        self.rooms().directory().list(include_inactive)
    }

    /// # Errors
    ///
    /// Fails for an invalid or taken name.
    pub async fn create_room(&self, spec: RoomSpec) -> Result<Room, CoreError> {
        self.rooms().directory().create(spec).await
    }

    /// # Errors
    ///
    /// [`CoreError::RoomNotFound`] for an unknown room.
    pub async fn update_room(&self, name: &str, update: RoomUpdate) -> Result<Room, CoreError> {
        self.rooms().directory().update(name, update).await
    }

    /// Live members of a room.
    ///
    /// # Errors
    ///
    /// [`CoreError::RoomNotFound`] for an unknown room.
    pub fn room_members(&self, room: &str) -> Result<Vec<ConnectionInfo>, CoreError> {
        self.known_room(room)?;
        Ok(self.rooms().members(room))
    }

    /// Presence records of a room.
    ///
    /// # Errors
    ///
    /// [`CoreError::RoomNotFound`] for an unknown room.
    pub fn room_presence(&self, room: &str) -> Result<Vec<PresenceRecord>, CoreError> {
        self.known_room(room)?;
        Ok(self.presence().records(room))
    }

    /// Room history without an access check.
    ///
    /// # Errors
    ///
    /// [`CoreError::RoomNotFound`] for an unknown room.
    pub async fn room_history(
        &self,
        room: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, CoreError> {
        self.messages().history(room, limit, before).await
    }

    /// Send a system message to a room.
    ///
    /// # Errors
    ///
    /// Fails for an unknown room, invalid content, or a broker failure.
    pub async fn send_as_system(
        &self,
        room: &str,
        content: String,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message, CoreError> {
        self.messages().send_system(room, content, metadata).await
    }

    /// Send a system message to every listed room and user.
    ///
    /// Each target is attempted independently.
    pub async fn broadcast(&self, request: BroadcastRequest) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for room in &request.rooms {
            match self
                .messages()
                .send_system(room, request.content.clone(), request.metadata.clone())
                .await
            {
                Ok(message) => report.sent.push(message),
                Err(e) => report.failed.push((format!("room:{}", room), e.to_string())),
            }
        }
        for user in &request.users {
            match self
                .messages()
                .send_system_direct(user, request.content.clone())
                .await
            {
                Ok(message) => report.sent.push(message),
                Err(e) => report.failed.push((format!("user:{}", user), e.to_string())),
            }
        }
        info!(
            sent = report.sent.len(),
            failed = report.failed.len(),
            "Admin broadcast"
        );
        report
    }

    /// Deliver an `event` frame to every connection with a matching topic
    /// pattern. Returns the number of deliveries.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a topic containing `*`.
    pub async fn publish_event(
        &self,
        topic: &str,
        data: serde_json::Value,
    ) -> Result<usize, CoreError> {
        if topic.is_empty() || topic.contains('*') {
            return Err(CoreError::Validation(format!("invalid topic {}", topic)));
        }
        let event = Arc::new(OutboundFrame::Event {
            event_type: topic.to_string(),
            data,
        });

        let mut delivered = 0;
        for group in self.broker().groups().await {
            let Some(pattern) = group.strip_prefix("topic:") else {
                continue;
            };
            if !topic_matches(pattern, topic) {
                continue;
            }
            match self
                .broker()
                .publish(&group, Arc::clone(&event))
                .await
            {
                Ok(count) => delivered += count,
                Err(e) => warn!(topic = %topic, pattern = %pattern, error = %e, "Event publish failed"),
            }
        }
        Ok(delivered)
    }

    fn known_room(&self, room: &str) -> Result<Room, CoreError> {
        self.rooms()
            .directory()
            .get(room)
            .ok_or_else(|| CoreError::RoomNotFound(room.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::ConnectRequest;
    use std::time::Duration;

    async fn hub() -> Hub {
        let mut config = HubConfig::default();
        config.rooms.push(RoomSpec::public("general"));
        Hub::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_force_disconnect() {
        let hub = hub().await;
        let (conn, mut channels) = hub
            .open(&ConnectRequest::new("10.0.0.1"), "memory")
            .await
            .unwrap();

        hub.force_disconnect(conn.id()).unwrap();
        channels.close.changed().await.unwrap();
        assert_eq!(*channels.close.borrow(), Some(CloseCode::ForceDisconnected));

        // Already closing.
        assert!(matches!(
            hub.force_disconnect(conn.id()),
            Err(CoreError::NotFound(_))
        ));
        assert!(hub.force_disconnect("conn_missing").is_err());
    }

    #[tokio::test]
    async fn test_publish_event_matches_patterns() {
        let hub = hub().await;
        let (orders, mut orders_ch) = hub
            .open(&ConnectRequest::new("10.0.0.1"), "memory")
            .await
            .unwrap();
        let (other, mut other_ch) = hub
            .open(&ConnectRequest::new("10.0.0.2"), "memory")
            .await
            .unwrap();
        hub.registry().subscribe_topic(&orders, "orders.*").await.unwrap();
        hub.registry().subscribe_topic(&other, "billing").await.unwrap();

        let delivered = hub
            .publish_event("orders.created", serde_json::json!({"id": 7}))
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let event = tokio::time::timeout(Duration::from_secs(1), orders_ch.outbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.type_name(), "event");
        assert!(other_ch.outbox.try_recv().is_err());

        assert!(hub.publish_event("orders.*", serde_json::Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reports_each_target() {
        let hub = hub().await;
        let report = hub
            .broadcast(BroadcastRequest {
                rooms: vec!["general".into(), "missing".into()],
                users: vec!["alice".into()],
                content: "maintenance at noon".into(),
                metadata: None,
            })
            .await;
        assert_eq!(report.sent.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "room:missing");

        let history = hub.room_history("general", 10, None).await.unwrap();
        assert_eq!(history[0].content, "maintenance at noon");
        assert!(history[0].sender.is_none());
    }

    #[tokio::test]
    async fn test_room_admin() {
        let hub = hub().await;
        hub.create_room(RoomSpec::public("ops")).await.unwrap();
        hub.update_room(
            "ops",
            RoomUpdate {
                active: Some(false),
                ..RoomUpdate::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hub.list_rooms(false).len(), 1);
        assert_eq!(hub.list_rooms(true).len(), 2);
        assert!(hub.room_members("ops").unwrap().is_empty());
        assert!(matches!(
            hub.room_presence("nope"),
            Err(CoreError::RoomNotFound(_))
        ));
    }
}
