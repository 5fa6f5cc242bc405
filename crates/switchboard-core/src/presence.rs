//! Presence tracking.
//!
//! Presence is aggregated per (identity, room): one record counts every open
//! connection of that identity in the room. Status is `offline` exactly when
//! the count is zero. Every mutation is broadcast to the room as a
//! `presence.update` event carrying only identity and status.

use crate::broker::{room_group, Broker};
use crate::error::CoreError;
use crate::metrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::{OutboundFrame, PresenceEntry, PresenceStatus};
use tracing::{debug, warn};

/// Maximum status message length.
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 256;

/// Presence state for one identity in one room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceRecord {
    pub identity: String,
    pub room: String,
    pub status: PresenceStatus,
    pub status_message: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub connection_count: u32,
}

impl PresenceRecord {
    fn new(identity: &str, room: &str) -> Self {
        let now = Utc::now();
        Self {
            identity: identity.to_string(),
            room: room.to_string(),
            status: PresenceStatus::Offline,
            status_message: None,
            joined_at: now,
            last_activity_at: now,
            connection_count: 0,
        }
    }

    /// Update the last activity timestamp.
    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Check if this record is offline and has had no activity for `max_age`.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match ChronoDuration::from_std(max_age) {
            Ok(max_age) => self.connection_count == 0 && now - self.last_activity_at > max_age,
            Err(_) => false,
        }
    }

    /// What room members see.
    #[must_use]
    pub fn entry(&self) -> PresenceEntry {
        PresenceEntry {
            identity: self.identity.clone(),
            status: self.status,
            status_message: self.status_message.clone(),
            last_activity: self.last_activity_at,
        }
    }

    fn update_frame(&self) -> OutboundFrame {
        OutboundFrame::PresenceUpdate {
            room: self.room.clone(),
            identity: self.identity.clone(),
            status: self.status,
            status_message: self.status_message.clone(),
        }
    }
}

type PresenceKey = (String, String);

fn key(identity: &str, room: &str) -> PresenceKey {
    (identity.to_string(), room.to_string())
}

/// Presence records for every room.
pub struct PresenceTracker {
    records: DashMap<PresenceKey, PresenceRecord>,
    broker: Arc<dyn Broker>,
    broker_timeout: Duration,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, broker_timeout: Duration) -> Self {
        Self {
            records: DashMap::new(),
            broker,
            broker_timeout,
        }
    }

    /// Broadcast a record change. A failed or timed-out publish is logged
    /// and counted; the record itself stays updated.
    async fn announce(&self, record: &PresenceRecord) {
        let group = room_group(&record.room);
        let publish = self.broker.publish(&group, Arc::new(record.update_frame()));
        match tokio::time::timeout(self.broker_timeout, publish).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                metrics::record_broker_failure("presence");
                warn!(room = %record.room, error = %e, "Presence broadcast failed");
            }
            Err(_) => {
                metrics::record_broker_failure("presence");
                warn!(room = %record.room, "Presence broadcast timed out");
            }
        }
    }

    /// Count one more open connection for `identity` in `room`.
    ///
    /// Creates the record on first join; an offline record comes back online.
    pub async fn increment(&self, identity: &str, room: &str) -> PresenceRecord {
        let record = {
            let mut record = self
                .records
                .entry(key(identity, room))
                .or_insert_with(|| PresenceRecord::new(identity, room));
            record.connection_count += 1;
            if record.status == PresenceStatus::Offline {
                record.status = PresenceStatus::Online;
            }
            record.touch();
            record.clone()
        };
        debug!(
            identity = %identity,
            room = %room,
            connections = record.connection_count,
            "Presence: connection added"
        );
        self.announce(&record).await;
        record
    }

    /// Count one fewer open connection. Reaching zero sets `offline` in the
    /// same step.
    pub async fn decrement(&self, identity: &str, room: &str) -> Option<PresenceRecord> {
        let record = {
            let mut record = self.records.get_mut(&key(identity, room))?;
            record.connection_count = record.connection_count.saturating_sub(1);
            if record.connection_count == 0 {
                record.status = PresenceStatus::Offline;
            }
            record.touch();
            record.clone()
        };
        debug!(
            identity = %identity,
            room = %room,
            connections = record.connection_count,
            "Presence: connection removed"
        );
        self.announce(&record).await;
        Some(record)
    }

    /// Set status and status message for an identity that is present.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] when the identity has no record in the
    /// room, and a validation error when marking `offline` while connections
    /// are still open or the status message is too long.
    pub async fn mark(
        &self,
        identity: &str,
        room: &str,
        status: PresenceStatus,
        status_message: Option<String>,
    ) -> Result<PresenceRecord, CoreError> {
        if status_message
            .as_deref()
            .is_some_and(|m| m.len() > MAX_STATUS_MESSAGE_LENGTH)
        {
            return Err(CoreError::Validation("status message too long".to_string()));
        }

        let record = {
            let mut record = self
                .records
                .get_mut(&key(identity, room))
                .ok_or_else(|| CoreError::NotFound(format!("presence of {} in {}", identity, room)))?;
            if status == PresenceStatus::Offline && record.connection_count > 0 {
                return Err(CoreError::Validation(
                    "cannot mark offline while connected".to_string(),
                ));
            }
            record.status = status;
            record.status_message = status_message;
            record.touch();
            record.clone()
        };
        self.announce(&record).await;
        Ok(record)
    }

    #[must_use]
    pub fn get(&self, identity: &str, room: &str) -> Option<PresenceRecord> {
        self.records.get(&key(identity, room)).map(|r| r.clone())
    }

    /// Presence entries for a room, sorted by identity.
    #[must_use]
    pub fn snapshot(&self, room: &str) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .records
            .iter()
            .filter(|r| r.room == room)
            .map(|r| r.entry())
            .collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    /// Full records for a room.
    #[must_use]
    pub fn records(&self, room: &str) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .records
            .iter()
            .filter(|r| r.room == room)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    /// Delete offline records with no activity for `max_age`.
    ///
    /// Returns the number of records removed.
    pub fn prune_stale(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|(identity, room), record| {
            let stale = record.is_stale(max_age, now);
            if stale {
                debug!(identity = %identity, room = %room, "Presence: pruned stale record");
            }
            !stale
        });
        before.saturating_sub(self.records.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, Event, InMemoryBroker};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    fn tracker() -> (PresenceTracker, Arc<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        (PresenceTracker::new(broker.clone(), Duration::from_secs(1)), broker)
    }

    /// Accepts publishes and never completes them.
    struct StalledBroker;

    #[async_trait]
    impl Broker for StalledBroker {
        async fn publish(&self, _group: &str, _event: Event) -> Result<usize, BrokerError> {
            std::future::pending().await
        }

        async fn subscribe(
            &self,
            _group: &str,
            _subscriber: &str,
        ) -> Result<broadcast::Receiver<Event>, BrokerError> {
            let (_tx, rx) = broadcast::channel(1);
            Ok(rx)
        }

        async fn unsubscribe(&self, _group: &str, _subscriber: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn unsubscribe_all(&self, _subscriber: &str) {}

        async fn groups(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_count_and_offline_transition() {
        let (presence, _) = tracker();

        let first = presence.increment("alice", "general").await;
        assert_eq!(first.connection_count, 1);
        assert_eq!(first.status, PresenceStatus::Online);
        presence.increment("alice", "general").await;

        let one_left = presence.decrement("alice", "general").await.unwrap();
        assert_eq!(one_left.connection_count, 1);
        assert_eq!(one_left.status, PresenceStatus::Online);

        let gone = presence.decrement("alice", "general").await.unwrap();
        assert_eq!(gone.connection_count, 0);
        assert_eq!(gone.status, PresenceStatus::Offline);

        // Never negative.
        let again = presence.decrement("alice", "general").await.unwrap();
        assert_eq!(again.connection_count, 0);
        assert!(presence.decrement("nobody", "general").await.is_none());
    }

    #[tokio::test]
    async fn test_mark_status() {
        let (presence, _) = tracker();
        presence.increment("alice", "general").await;

        let away = presence
            .mark("alice", "general", PresenceStatus::Away, Some("lunch".into()))
            .await
            .unwrap();
        assert_eq!(away.status, PresenceStatus::Away);
        assert_eq!(away.status_message.as_deref(), Some("lunch"));

        assert!(matches!(
            presence.mark("alice", "general", PresenceStatus::Offline, None).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            presence.mark("bob", "general", PresenceStatus::Busy, None).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mutations_broadcast_without_counts() {
        let (presence, broker) = tracker();
        let mut rx = broker.subscribe("room:general", "watcher").await.unwrap();

        presence.increment("alice", "general").await;
        let event = rx.recv().await.unwrap();
        assert_eq!(
            *event,
            OutboundFrame::PresenceUpdate {
                room: "general".into(),
                identity: "alice".into(),
                status: PresenceStatus::Online,
                status_message: None,
            }
        );
        let json = serde_json::to_value(&*event).unwrap();
        assert!(json.get("connection_count").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_increments_and_decrements() {
        let (presence, _) = tracker();
        let presence = Arc::new(presence);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let p = Arc::clone(&presence);
            handles.push(tokio::spawn(async move {
                p.increment("alice", "general").await;
                p.decrement("alice", "general").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = presence.get("alice", "general").unwrap();
        assert_eq!(record.connection_count, 0);
        assert_eq!(record.status, PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_broker_does_not_block_updates() {
        let presence = PresenceTracker::new(Arc::new(StalledBroker), Duration::from_secs(1));

        let record = presence.increment("alice", "general").await;
        assert_eq!(record.status, PresenceStatus::Online);
        let record = presence.decrement("alice", "general").await.unwrap();
        assert_eq!(record.connection_count, 0);
        assert_eq!(record.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_snapshot_and_prune() {
        let (presence, _) = tracker();
        presence.increment("bob", "general").await;
        presence.increment("alice", "general").await;
        presence.increment("carol", "other").await;
        presence.decrement("bob", "general").await;

        let snapshot = presence.snapshot("general");
        let names: Vec<&str> = snapshot.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);

        let later = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(presence.prune_stale(Duration::from_secs(60), later), 1);
        assert!(presence.get("bob", "general").is_none());
        assert!(presence.get("alice", "general").is_some());
    }
}
