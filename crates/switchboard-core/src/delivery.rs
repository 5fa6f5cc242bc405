//! Message send, history and retention.
//!
//! Every message is persisted `pending` before it is published. It becomes
//! `delivered` only when the broker accepts it; a broker failure leaves it
//! `failed` and surfaces an error to the sender.

use crate::broker::{room_group, user_group, Broker};
use crate::config::RetentionConfig;
use crate::connection::ConnectionHandle;
use crate::error::CoreError;
use crate::membership::RoomService;
use crate::message::{Destination, Message, MessageDraft, MessageId};
use crate::metrics;
use crate::store::{HistoryQuery, Store};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use switchboard_admission::Identity;
use switchboard_protocol::{DeliveryStatus, MessageType, OutboundFrame};
use tracing::{debug, info, warn};

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest page a history query may request.
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub expired: usize,
    pub deleted: usize,
}

/// Message delivery.
pub struct MessageService {
    store: Arc<dyn Store>,
    rooms: Arc<RoomService>,
    broker: Arc<dyn Broker>,
    max_content_bytes: usize,
    broker_timeout: Duration,
    retention: RetentionConfig,
}

impl MessageService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        rooms: Arc<RoomService>,
        broker: Arc<dyn Broker>,
        max_content_bytes: usize,
        broker_timeout: Duration,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            store,
            rooms,
            broker,
            max_content_bytes,
            broker_timeout,
            retention,
        }
    }

    fn validate_content(&self, content: &str) -> Result<(), CoreError> {
        if content.is_empty() {
            return Err(CoreError::Validation("content cannot be empty".to_string()));
        }
        if content.len() > self.max_content_bytes {
            return Err(CoreError::Validation(format!(
                "content size {} exceeds {}",
                content.len(),
                self.max_content_bytes
            )));
        }
        Ok(())
    }

    /// Send a message from a connection.
    ///
    /// # Errors
    ///
    /// Validation fails before anything is stored. Room messages additionally
    /// require an active room the sender has joined and may send to. A
    /// broker failure after persisting marks the message `failed` and returns
    /// [`CoreError::BrokerUnavailable`].
    pub async fn send(
        &self,
        sender: &ConnectionHandle,
        draft: MessageDraft,
    ) -> Result<Message, CoreError> {
        self.validate_content(&draft.content)?;
        if draft.message_type == MessageType::System {
            return Err(CoreError::Validation(
                "system messages cannot be sent by clients".to_string(),
            ));
        }
        let destination = draft.destination()?;
        if let Destination::Room(room_name) = &destination {
            let room = self.rooms.directory().active(room_name)?;
            if !sender.in_room(room_name) {
                return Err(CoreError::NotSubscribed(room_name.clone()));
            }
            if !room.can_send(sender.identity()) {
                return Err(CoreError::PermissionDenied(format!(
                    "sending to {}",
                    room_name
                )));
            }
        }

        let message = Message::new(destination, draft.message_type, draft.content)
            .with_sender(sender.label(), Some(sender.id().to_string()))
            .with_metadata(draft.metadata)
            .with_expiry(draft.expires_at);
        self.dispatch(message, Some(sender)).await
    }

    /// Send a system message (no sender) to a room.
    ///
    /// # Errors
    ///
    /// Fails for an unknown room, invalid content, or a broker failure.
    pub async fn send_system(
        &self,
        room: &str,
        content: String,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message, CoreError> {
        self.validate_content(&content)?;
        self.rooms.directory().active(room)?;
        let message = Message::new(Destination::Room(room.to_string()), MessageType::System, content)
            .with_metadata(metadata);
        self.dispatch(message, None).await
    }

    /// Send a system message directly to one user.
    ///
    /// # Errors
    ///
    /// Fails for invalid content or a broker failure.
    pub async fn send_system_direct(
        &self,
        recipient: &str,
        content: String,
    ) -> Result<Message, CoreError> {
        self.validate_content(&content)?;
        let message = Message::new(
            Destination::Direct(recipient.to_string()),
            MessageType::System,
            content,
        );
        self.dispatch(message, None).await
    }

    async fn publish(&self, group: &str, frame: OutboundFrame) -> Result<usize, CoreError> {
        let publish = self.broker.publish(group, Arc::new(frame));
        match tokio::time::timeout(self.broker_timeout, publish).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => Err(CoreError::BrokerUnavailable(e.to_string())),
            Err(_) => Err(CoreError::BrokerUnavailable("broker timed out".to_string())),
        }
    }

    /// Persist `pending`, publish, then record the outcome.
    async fn dispatch(
        &self,
        message: Message,
        sender: Option<&ConnectionHandle>,
    ) -> Result<Message, CoreError> {
        self.store.insert_message(&message).await?;

        let (kind, group) = match &message.destination {
            Destination::Room(room) => ("room", room_group(room)),
            Destination::Direct(recipient) => ("direct", user_group(recipient)),
        };
        let mut view = message.view();
        view.delivery_status = DeliveryStatus::Delivered;
        view.delivered_at = Some(Utc::now());
        let published = self
            .publish(&group, OutboundFrame::MessageNew { message: view })
            .await;

        match published {
            Ok(0) if message.recipient().is_some() => {
                // Recipient offline: stays pending.
                debug!(message = %message.id, "Direct message queued for offline recipient");
                self.echo(sender, &message);
                metrics::record_message(kind, "pending");
                Ok(message)
            }
            Ok(receivers) => {
                let delivered = match self
                    .store
                    .set_status(message.id, DeliveryStatus::Delivered)
                    .await
                {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        // Receivers already hold the event; the record must not stay pending.
                        if let Err(store_err) =
                            self.store.set_status(message.id, DeliveryStatus::Failed).await
                        {
                            warn!(message = %message.id, error = %store_err, "Could not mark message failed");
                        }
                        metrics::record_message(kind, "failed");
                        warn!(
                            message = %message.id,
                            receivers,
                            error = %e,
                            "Message published but delivery could not be recorded"
                        );
                        return Err(e.into());
                    }
                };
                if delivered.recipient().is_some() {
                    self.echo(sender, &delivered);
                }
                metrics::record_message(kind, "delivered");
                debug!(message = %delivered.id, receivers, "Message delivered");
                Ok(delivered)
            }
            Err(e) => {
                if let Err(store_err) = self.store.set_status(message.id, DeliveryStatus::Failed).await {
                    warn!(message = %message.id, error = %store_err, "Could not mark message failed");
                }
                metrics::record_message(kind, "failed");
                warn!(message = %message.id, error = %e, "Message delivery failed");
                Err(e)
            }
        }
    }

    /// Direct messages are echoed to the sending connection unless it is
    /// itself a recipient.
    fn echo(&self, sender: Option<&ConnectionHandle>, message: &Message) {
        if let Some(sender) = sender {
            if message.recipient() != sender.identity().user_id() {
                sender.deliver(Arc::new(OutboundFrame::MessageNew {
                    message: message.view(),
                }));
            }
        }
    }

    /// Room history, newest first, access-checked like a join.
    ///
    /// Rooms with history disabled return an empty page.
    ///
    /// # Errors
    ///
    /// [`CoreError::RoomNotFound`] for unknown rooms and
    /// [`CoreError::PermissionDenied`] when access is refused.
    pub async fn history_for(
        &self,
        identity: &Identity,
        room: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, CoreError> {
        let record = self
            .rooms
            .directory()
            .get(room)
            .ok_or_else(|| CoreError::RoomNotFound(room.to_string()))?;
        self.rooms.check_access(identity, &record).await?;
        self.history(room, limit, before).await
    }

    /// Room history without an access check.
    ///
    /// # Errors
    ///
    /// [`CoreError::RoomNotFound`] for unknown rooms.
    pub async fn history(
        &self,
        room: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, CoreError> {
        let record = self
            .rooms
            .directory()
            .get(room)
            .ok_or_else(|| CoreError::RoomNotFound(room.to_string()))?;
        if !record.features.history || limit == 0 {
            return Ok(Vec::new());
        }
        let query = HistoryQuery {
            limit: limit.min(MAX_HISTORY_LIMIT),
            before,
        };
        Ok(self.store.room_history(room, query).await?)
    }

    /// Mark a message delivered.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown messages and a validation error
    /// for expired ones.
    pub async fn mark_delivered(&self, id: MessageId) -> Result<Message, CoreError> {
        let message = self
            .store
            .get_message(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {}", id)))?;
        match message.delivery_status {
            DeliveryStatus::Delivered => Ok(message),
            DeliveryStatus::Expired => Err(CoreError::Validation(format!(
                "message {} has expired",
                id
            ))),
            DeliveryStatus::Pending | DeliveryStatus::Failed => Ok(self
                .store
                .set_status(id, DeliveryStatus::Delivered)
                .await?),
        }
    }

    /// Expire due messages and delete those past retention.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreUnavailable`] if the store fails.
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<PurgeReport, CoreError> {
        let mut report = PurgeReport {
            expired: self.store.expire_due(now).await?,
            ..PurgeReport::default()
        };

        for room in self.store.message_rooms().await? {
            let room_days = self
                .rooms
                .directory()
                .get(&room)
                .map(|r| r.message_retention_days)
                .unwrap_or(0);
            if let Some(days) = self.retention.effective_days(room_days) {
                let cutoff = now - ChronoDuration::days(i64::from(days));
                report.deleted += self.store.delete_before(Some(&room), cutoff).await?;
            }
        }
        if let Some(days) = self.retention.effective_days(0) {
            let cutoff = now - ChronoDuration::days(i64::from(days));
            report.deleted += self.store.delete_before(None, cutoff).await?;
        }

        metrics::record_retention("expired", report.expired);
        metrics::record_retention("deleted", report.deleted);
        if report.expired > 0 || report.deleted > 0 {
            info!(expired = report.expired, deleted = report.deleted, "Retention sweep");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::connection::SessionChannels;
    use crate::membership::AllowAll;
    use crate::presence::PresenceTracker;
    use crate::registry::ConnectionRegistry;
    use crate::room::{Room, RoomDirectory, RoomFeatures, RoomSpec, RoomType};
    use crate::store::{MemoryStore, StoreError};
    use crate::broker::{BrokerError, Event};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct Fixture {
        messages: MessageService,
        rooms: Arc<RoomService>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<MemoryStore>,
    }

    fn fixture_with(broker: Arc<dyn Broker>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        fixture_on(broker, store.clone(), store)
    }

    fn fixture_on(broker: Arc<dyn Broker>, store: Arc<MemoryStore>, backing: Arc<dyn Store>) -> Fixture {
        let directory = Arc::new(RoomDirectory::new(backing.clone()));
        let registry = Arc::new(ConnectionRegistry::new(broker.clone(), Duration::from_secs(1)));
        let presence = Arc::new(PresenceTracker::new(broker.clone(), Duration::from_secs(1)));
        let rooms = Arc::new(RoomService::new(
            directory,
            registry.clone(),
            presence,
            broker.clone(),
            Arc::new(AllowAll),
            Duration::from_secs(1),
        ));
        let messages = MessageService::new(
            backing,
            rooms.clone(),
            broker,
            64 * 1024,
            Duration::from_secs(1),
            RetentionConfig::default(),
        );
        Fixture {
            messages,
            rooms,
            registry,
            store,
        }
    }

    async fn fixture() -> Fixture {
        let fx = fixture_with(Arc::new(InMemoryBroker::new()));
        fx.rooms
            .directory()
            .create(RoomSpec::public("general"))
            .await
            .unwrap();
        fx
    }

    async fn member(fx: &Fixture, id: &str, user: &str) -> (Arc<ConnectionHandle>, SessionChannels) {
        let (conn, channels) = ConnectionHandle::new(id, Identity::user(user), "10.0.0.1", "memory");
        let conn = Arc::new(conn);
        fx.registry.register(conn.clone()).await.unwrap();
        fx.rooms.join(&conn, "general").await.unwrap();
        (conn, channels)
    }

    #[tokio::test]
    async fn test_room_send_delivers_and_persists() {
        let fx = fixture().await;
        let (alice, _ch) = member(&fx, "c1", "alice").await;

        let sent = fx
            .messages
            .send(&alice, MessageDraft::to_room("general", "hi"))
            .await
            .unwrap();
        assert_eq!(sent.delivery_status, DeliveryStatus::Delivered);
        assert!(sent.delivered_at.is_some());
        assert_eq!(sent.sender.as_deref(), Some("alice"));

        let history = fx.messages.history("general", 10, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, sent.id);
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected_without_persisting() {
        let fx = fixture().await;
        let (alice, _ch) = member(&fx, "c1", "alice").await;

        let result = fx
            .messages
            .send(&alice, MessageDraft::to_room("general", ""))
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(fx.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_room_send_requires_membership_and_permission() {
        let fx = fixture().await;
        let (conn, _ch) = ConnectionHandle::new("c1", Identity::user("alice"), "10.0.0.1", "memory");
        let conn = Arc::new(conn);
        fx.registry.register(conn.clone()).await.unwrap();

        assert!(matches!(
            fx.messages.send(&conn, MessageDraft::to_room("general", "hi")).await,
            Err(CoreError::NotSubscribed(_))
        ));
        assert!(matches!(
            fx.messages.send(&conn, MessageDraft::to_room("nowhere", "hi")).await,
            Err(CoreError::RoomNotFound(_))
        ));

        let mut announcements = RoomSpec::public("announcements");
        announcements.room_type = RoomType::Broadcast;
        announcements.owner = Some("olivia".into());
        fx.rooms.directory().create(announcements).await.unwrap();
        fx.rooms.join(&conn, "announcements").await.unwrap();
        assert!(matches!(
            fx.messages
                .send(&conn, MessageDraft::to_room("announcements", "hi"))
                .await,
            Err(CoreError::PermissionDenied(_))
        ));
        assert_eq!(fx.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_direct_message_online_and_offline() {
        let fx = fixture().await;
        let (alice, mut alice_ch) = member(&fx, "c1", "alice").await;
        let (_bob, mut bob_ch) = member(&fx, "c2", "bob").await;

        let delivered = fx
            .messages
            .send(&alice, MessageDraft::to_user("bob", "psst"))
            .await
            .unwrap();
        assert_eq!(delivered.delivery_status, DeliveryStatus::Delivered);

        let mut bob_got_it = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), bob_ch.outbox.recv()).await
        {
            if let OutboundFrame::MessageNew { message } = &*event {
                bob_got_it = message.content == "psst";
                break;
            }
        }
        assert!(bob_got_it);

        let queued = fx
            .messages
            .send(&alice, MessageDraft::to_user("carol", "later"))
            .await
            .unwrap();
        assert_eq!(queued.delivery_status, DeliveryStatus::Pending);

        // The sender sees its own direct messages.
        let mut echoes = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), alice_ch.outbox.recv()).await
        {
            if let OutboundFrame::MessageNew { message } = &*event {
                if message.recipient.is_some() {
                    echoes += 1;
                }
            }
        }
        assert_eq!(echoes, 2);
    }

    struct FailingBroker;

    #[async_trait]
    impl Broker for FailingBroker {
        async fn publish(&self, _group: &str, _event: Event) -> Result<usize, BrokerError> {
            Err(BrokerError::Unavailable("down".into()))
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
    async fn test_broker_failure_marks_failed() {
        let fx = fixture_with(Arc::new(FailingBroker));
        fx.rooms
            .directory()
            .create(RoomSpec::public("general"))
            .await
            .unwrap();
        let (alice, _ch) = member(&fx, "c1", "alice").await;

        let result = fx
            .messages
            .send(&alice, MessageDraft::to_room("general", "hi"))
            .await;
        assert!(matches!(result, Err(CoreError::BrokerUnavailable(_))));

        let stored = fx.messages.history("general", 10, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Failed);

        let recovered = fx.messages.mark_delivered(stored[0].id).await.unwrap();
        assert_eq!(recovered.delivery_status, DeliveryStatus::Delivered);
    }

    /// Memory store that cannot record deliveries.
    struct NoDeliveryStore(Arc<MemoryStore>);

    #[async_trait]
    impl Store for NoDeliveryStore {
        async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
            self.0.insert_message(message).await
        }

        async fn set_status(
            &self,
            id: MessageId,
            status: DeliveryStatus,
        ) -> Result<Message, StoreError> {
            if status == DeliveryStatus::Delivered {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.0.set_status(id, status).await
        }

        async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
            self.0.get_message(id).await
        }

        async fn room_history(
            &self,
            room: &str,
            query: HistoryQuery,
        ) -> Result<Vec<Message>, StoreError> {
            self.0.room_history(room, query).await
        }

        async fn delete_before(
            &self,
            room: Option<&str>,
            cutoff: DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            self.0.delete_before(room, cutoff).await
        }

        async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
            self.0.expire_due(now).await
        }

        async fn message_rooms(&self) -> Result<Vec<String>, StoreError> {
            self.0.message_rooms().await
        }

        async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
            self.0.save_room(room).await
        }

        async fn load_rooms(&self) -> Result<Vec<Room>, StoreError> {
            self.0.load_rooms().await
        }
    }

    #[tokio::test]
    async fn test_unrecorded_delivery_marks_failed() {
        let store = Arc::new(MemoryStore::new());
        let fx = fixture_on(
            Arc::new(InMemoryBroker::new()),
            store.clone(),
            Arc::new(NoDeliveryStore(store.clone())),
        );
        fx.rooms
            .directory()
            .create(RoomSpec::public("general"))
            .await
            .unwrap();
        let (alice, _ch) = member(&fx, "c1", "alice").await;

        let result = fx
            .messages
            .send(&alice, MessageDraft::to_room("general", "hi"))
            .await;
        assert!(matches!(result, Err(CoreError::StoreUnavailable(_))));

        let stored = fx.messages.history("general", 10, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_history_respects_feature_and_access() {
        let fx = fixture().await;
        let mut quiet = RoomSpec::public("quiet");
        quiet.features = RoomFeatures {
            history: false,
            ..RoomFeatures::default()
        };
        fx.rooms.directory().create(quiet).await.unwrap();
        fx.messages
            .send_system("quiet", "maintenance".into(), None)
            .await
            .unwrap();
        assert!(fx.messages.history("quiet", 10, None).await.unwrap().is_empty());

        let mut vip = RoomSpec::public("vip");
        vip.allowed = vec!["alice".into()];
        fx.rooms.directory().create(vip).await.unwrap();
        assert!(matches!(
            fx.messages
                .history_for(&Identity::user("mallory"), "vip", 10, None)
                .await,
            Err(CoreError::PermissionDenied(_))
        ));
        assert!(fx
            .messages
            .history_for(&Identity::user("alice"), "vip", 10, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let fx = fixture().await;
        let mut short = RoomSpec::public("short");
        short.message_retention_days = 1;
        fx.rooms.directory().create(short).await.unwrap();

        let two_days_ago = Utc::now() - ChronoDuration::days(2);
        for room in ["general", "short"] {
            let mut old = Message::new(Destination::Room(room.into()), MessageType::Text, "old");
            old.created_at = two_days_ago;
            fx.store.insert_message(&old).await.unwrap();
        }
        let expiring = Message::new(Destination::Room("general".into()), MessageType::Text, "soon")
            .with_expiry(Some(Utc::now() - ChronoDuration::seconds(1)));
        fx.store.insert_message(&expiring).await.unwrap();

        let report = fx.messages.sweep_retention(Utc::now()).await.unwrap();
        assert_eq!(report, PurgeReport { expired: 1, deleted: 1 });
        assert!(fx.messages.history("short", 10, None).await.unwrap().is_empty());
        // 30-day global ceiling keeps the general message.
        assert_eq!(fx.messages.history("general", 10, None).await.unwrap().len(), 1);
        assert!(matches!(
            fx.messages.mark_delivered(expiring.id).await,
            Err(CoreError::Validation(_))
        ));
    }
}
