//! Room membership: join, leave and broadcast.
//!
//! The live-member set of a room only ever holds connections that are open.
//! Joins check the room's policy and capacity under the member-set lock, so
//! concurrent joins can never overfill a room.

use crate::broker::{room_group, Broker};
use crate::connection::{ConnectionHandle, ConnectionInfo};
use crate::error::CoreError;
use crate::metrics;
use crate::presence::{PresenceRecord, PresenceTracker};
use crate::registry::ConnectionRegistry;
use crate::room::{Room, RoomDirectory};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_admission::Identity;
use switchboard_protocol::{OutboundFrame, PresenceStatus};
use tracing::{debug, info, warn};

/// External room-authorization capability, consulted after the room's own
/// policy admits an identity.
#[async_trait]
pub trait RoomAuthorizer: Send + Sync {
    /// # Errors
    ///
    /// An error is treated as a denial.
    async fn authorize(&self, identity: &Identity, room: &Room) -> Result<bool, CoreError>;
}

/// Defers entirely to the room's own policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl RoomAuthorizer for AllowAll {
    async fn authorize(&self, _identity: &Identity, _room: &Room) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: Room,
    /// The connection was already a member; nothing changed.
    pub already_member: bool,
}

/// Room membership operations.
pub struct RoomService {
    directory: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    broker: Arc<dyn Broker>,
    authorizer: Arc<dyn RoomAuthorizer>,
    /// room -> live connection id -> whether presence was counted at join
    members: DashMap<String, HashMap<String, bool>>,
    broker_timeout: Duration,
}

impl RoomService {
    #[must_use]
    pub fn new(
        directory: Arc<RoomDirectory>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        broker: Arc<dyn Broker>,
        authorizer: Arc<dyn RoomAuthorizer>,
        broker_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            registry,
            presence,
            broker,
            authorizer,
            members: DashMap::new(),
            broker_timeout,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    /// Apply the room's policy and the external authorizer.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PermissionDenied`] when either refuses.
    pub async fn check_access(&self, identity: &Identity, room: &Room) -> Result<(), CoreError> {
        if !room.can_join(identity) {
            return Err(CoreError::PermissionDenied(room.name.clone()));
        }
        match self.authorizer.authorize(identity, room).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::PermissionDenied(room.name.clone())),
            Err(e) => {
                warn!(room = %room.name, error = %e, "Room authorization failed");
                Err(CoreError::PermissionDenied(room.name.clone()))
            }
        }
    }

    /// Add a connection to a room's live members.
    ///
    /// # Errors
    ///
    /// [`CoreError::RoomNotFound`] for unknown or inactive rooms,
    /// [`CoreError::PermissionDenied`] when access is refused,
    /// [`CoreError::RoomFull`] at `max_connections`, and
    /// [`CoreError::BrokerUnavailable`] if the broker subscription fails.
    pub async fn join(
        &self,
        conn: &ConnectionHandle,
        room_name: &str,
    ) -> Result<JoinOutcome, CoreError> {
        let room = self.directory.active(room_name)?;
        self.check_access(conn.identity(), &room).await?;
        if !conn.is_open() {
            return Err(CoreError::Internal(format!("connection {} is not open", conn.id())));
        }

        {
            let mut members = self.members.entry(room.name.clone()).or_default();
            if members.contains_key(conn.id()) {
                return Ok(JoinOutcome {
                    room,
                    already_member: true,
                });
            }
            if room.max_connections > 0 && members.len() >= room.max_connections {
                debug!(room = %room.name, max = room.max_connections, "Room full");
                return Err(CoreError::RoomFull(room.name.clone()));
            }
            members.insert(conn.id().to_string(), room.features.presence);
        }
        conn.rooms_set().insert(room.name.clone());

        if let Err(e) = self.registry.subscribe(conn, &room_group(&room.name)).await {
            self.remove_member(&room.name, conn);
            return Err(e);
        }
        // Closed while joining: undo so the member set only holds open connections.
        if !conn.is_open() {
            self.remove_member(&room.name, conn);
            let _ = self.registry.unsubscribe(conn, &room_group(&room.name)).await;
            return Err(CoreError::Internal(format!("connection {} closed", conn.id())));
        }

        let label = conn.label();
        if room.features.presence {
            self.presence.increment(&label, &room.name).await;
        }
        self.announce(
            &room.name,
            OutboundFrame::UserJoined {
                room: room.name.clone(),
                identity: label.clone(),
            },
        )
        .await;

        metrics::record_room_join();
        info!(connection = %conn.id(), identity = %label, room = %room.name, "Joined room");
        Ok(JoinOutcome {
            room,
            already_member: false,
        })
    }

    /// Returns whether presence was counted for the removed membership, or
    /// `None` if the connection was not a member.
    fn remove_member(&self, room: &str, conn: &ConnectionHandle) -> Option<bool> {
        let removed = self
            .members
            .get_mut(room)
            .and_then(|mut members| members.remove(conn.id()));
        self.members.remove_if(room, |_, members| members.is_empty());
        conn.rooms_set().remove(room);
        removed
    }

    /// Remove a connection from a room.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotSubscribed`] if the connection is not a member.
    pub async fn leave(&self, conn: &ConnectionHandle, room_name: &str) -> Result<(), CoreError> {
        let Some(presence_counted) = self.remove_member(room_name, conn) else {
            return Err(CoreError::NotSubscribed(room_name.to_string()));
        };

        match self.registry.unsubscribe(conn, &room_group(room_name)).await {
            Ok(()) | Err(CoreError::NotSubscribed(_)) => {}
            Err(e) => warn!(connection = %conn.id(), room = %room_name, error = %e, "Unsubscribe failed"),
        }

        let label = conn.label();
        if presence_counted {
            self.presence.decrement(&label, room_name).await;
        }
        self.announce(
            room_name,
            OutboundFrame::UserLeft {
                room: room_name.to_string(),
                identity: label.clone(),
            },
        )
        .await;

        debug!(connection = %conn.id(), identity = %label, room = %room_name, "Left room");
        Ok(())
    }

    /// Leave every room the connection is in.
    pub async fn leave_all(&self, conn: &ConnectionHandle) {
        for room in conn.rooms() {
            if let Err(e) = self.leave(conn, &room).await {
                debug!(connection = %conn.id(), room = %room, error = %e, "Leave on close skipped");
            }
        }
    }

    /// Deliver `frame` to every live member of a room.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BrokerUnavailable`] when the broker fails or times out.
    pub async fn broadcast(&self, room_name: &str, frame: OutboundFrame) -> Result<usize, CoreError> {
        let group = room_group(room_name);
        let publish = self.broker.publish(&group, Arc::new(frame));
        match tokio::time::timeout(self.broker_timeout, publish).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => Err(CoreError::BrokerUnavailable(e.to_string())),
            Err(_) => Err(CoreError::BrokerUnavailable("broker timed out".to_string())),
        }
    }

    async fn announce(&self, room_name: &str, frame: OutboundFrame) {
        if let Err(e) = self.broadcast(room_name, frame).await {
            warn!(room = %room_name, error = %e, "Room announcement failed");
        }
    }

    /// Broadcast a typing indicator from a member.
    ///
    /// # Errors
    ///
    /// Fails when the room is unknown, the connection is not a member, or
    /// typing indicators are disabled for the room.
    pub async fn typing(
        &self,
        conn: &ConnectionHandle,
        room_name: &str,
        started: bool,
    ) -> Result<(), CoreError> {
        let room = self.directory.active(room_name)?;
        if !conn.in_room(room_name) {
            return Err(CoreError::NotSubscribed(room_name.to_string()));
        }
        if !room.features.typing {
            return Err(CoreError::FeatureDisabled(format!("typing in {}", room_name)));
        }

        let identity = conn.label();
        let room = room.name;
        let frame = if started {
            OutboundFrame::TypingStart { room, identity }
        } else {
            OutboundFrame::TypingStop { room, identity }
        };
        self.broadcast(room_name, frame).await.map(|_| ())
    }

    /// Set the connection's status in every joined room with presence enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotSubscribed`] when no joined room tracks presence.
    pub async fn update_presence(
        &self,
        conn: &ConnectionHandle,
        status: PresenceStatus,
        status_message: Option<String>,
    ) -> Result<Vec<PresenceRecord>, CoreError> {
        let label = conn.label();
        let mut updated = Vec::new();
        for room in conn.rooms() {
            let tracked = self
                .directory
                .get(&room)
                .is_some_and(|r| r.features.presence);
            if tracked {
                updated.push(
                    self.presence
                        .mark(&label, &room, status, status_message.clone())
                        .await?,
                );
            }
        }
        if updated.is_empty() {
            return Err(CoreError::NotSubscribed(
                "no joined room tracks presence".to_string(),
            ));
        }
        Ok(updated)
    }

    /// Live member count of a room.
    #[must_use]
    pub fn member_count(&self, room_name: &str) -> usize {
        self.members.get(room_name).map(|m| m.len()).unwrap_or(0)
    }

    /// Live members of a room.
    #[must_use]
    pub fn members(&self, room_name: &str) -> Vec<ConnectionInfo> {
        let ids: Vec<String> = self
            .members
            .get(room_name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let mut infos: Vec<ConnectionInfo> = ids
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|conn| conn.info())
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }

    /// Number of rooms with at least one live member.
    #[must_use]
    pub fn occupied_rooms(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::room::{RoomFeatures, RoomSpec, RoomUpdate};
    use crate::store::MemoryStore;
    use switchboard_protocol::OutboundFrame;

    struct Fixture {
        rooms: Arc<RoomService>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
    }

    async fn fixture() -> Fixture {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let directory = Arc::new(RoomDirectory::new(Arc::new(MemoryStore::new())));
        directory.create(RoomSpec::public("general")).await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new(broker.clone(), Duration::from_secs(1)));
        let presence = Arc::new(PresenceTracker::new(broker.clone(), Duration::from_secs(1)));
        let rooms = Arc::new(RoomService::new(
            directory,
            registry.clone(),
            presence.clone(),
            broker,
            Arc::new(AllowAll),
            Duration::from_secs(1),
        ));
        Fixture {
            rooms,
            registry,
            presence,
        }
    }

    async fn open(
        fx: &Fixture,
        id: &str,
        identity: Identity,
    ) -> (Arc<ConnectionHandle>, crate::connection::SessionChannels) {
        let (conn, channels) = ConnectionHandle::new(id, identity, "10.0.0.1", "memory");
        let conn = Arc::new(conn);
        fx.registry.register(conn.clone()).await.unwrap();
        (conn, channels)
    }

    #[tokio::test]
    async fn test_join_broadcasts_and_tracks_presence() {
        let fx = fixture().await;
        let (alice, _a) = open(&fx, "c1", Identity::user("alice")).await;
        let (bob, mut bob_rx) = open(&fx, "c2", Identity::user("bob")).await;

        fx.rooms.join(&bob, "general").await.unwrap();
        let outcome = fx.rooms.join(&alice, "general").await.unwrap();
        assert!(!outcome.already_member);
        assert!(fx.rooms.join(&alice, "general").await.unwrap().already_member);

        assert_eq!(fx.rooms.member_count("general"), 2);
        assert!(alice.in_room("general"));
        assert_eq!(
            fx.presence.get("alice", "general").unwrap().connection_count,
            1
        );

        // Bob sees alice arrive.
        let mut saw_join = false;
        while let Ok(event) = tokio::time::timeout(Duration::from_millis(100), bob_rx.outbox.recv()).await {
            if let Some(event) = event {
                if *event == (OutboundFrame::UserJoined { room: "general".into(), identity: "alice".into() }) {
                    saw_join = true;
                    break;
                }
            }
        }
        assert!(saw_join);
    }

    #[tokio::test]
    async fn test_join_errors() {
        let fx = fixture().await;
        let (c, _ch) = open(&fx, "c1", Identity::user("mallory")).await;

        assert!(matches!(
            fx.rooms.join(&c, "missing").await,
            Err(CoreError::RoomNotFound(_))
        ));

        let mut vip = RoomSpec::public("vip");
        vip.owner = Some("olivia".into());
        vip.allowed = vec!["alice".into()];
        fx.rooms.directory().create(vip).await.unwrap();
        assert!(matches!(
            fx.rooms.join(&c, "vip").await,
            Err(CoreError::PermissionDenied(_))
        ));

        fx.rooms.directory().deactivate("general").await.unwrap();
        assert!(matches!(
            fx.rooms.join(&c, "general").await,
            Err(CoreError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let fx = fixture().await;
        fx.rooms
            .directory()
            .update(
                "general",
                RoomUpdate {
                    max_connections: Some(2),
                    ..RoomUpdate::default()
                },
            )
            .await
            .unwrap();

        let mut held = Vec::new();
        for i in 0..2 {
            let (c, ch) = open(&fx, &format!("c{}", i), Identity::user(format!("u{}", i))).await;
            fx.rooms.join(&c, "general").await.unwrap();
            held.push((c, ch));
        }
        let (third, _ch) = open(&fx, "c9", Identity::user("u9")).await;
        assert!(matches!(
            fx.rooms.join(&third, "general").await,
            Err(CoreError::RoomFull(_))
        ));

        fx.rooms.leave(&held[0].0, "general").await.unwrap();
        fx.rooms.join(&third, "general").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_never_overfill() {
        let fx = fixture().await;
        fx.rooms
            .directory()
            .update(
                "general",
                RoomUpdate {
                    max_connections: Some(5),
                    ..RoomUpdate::default()
                },
            )
            .await
            .unwrap();

        let mut conns = Vec::new();
        for i in 0..20 {
            conns.push(open(&fx, &format!("c{}", i), Identity::Anonymous).await);
        }

        let mut handles = Vec::new();
        for (conn, _) in &conns {
            let rooms = Arc::clone(&fx.rooms);
            let conn = Arc::clone(conn);
            handles.push(tokio::spawn(async move { rooms.join(&conn, "general").await.is_ok() }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(fx.rooms.member_count("general"), 5);
    }

    #[tokio::test]
    async fn test_leave_and_closed_connections() {
        let fx = fixture().await;
        let (c, _ch) = open(&fx, "c1", Identity::user("alice")).await;
        fx.rooms.join(&c, "general").await.unwrap();

        fx.rooms.leave(&c, "general").await.unwrap();
        assert!(matches!(
            fx.rooms.leave(&c, "general").await,
            Err(CoreError::NotSubscribed(_))
        ));
        assert_eq!(
            fx.presence.get("alice", "general").unwrap().status,
            PresenceStatus::Offline
        );

        c.request_close(switchboard_protocol::CloseCode::Normal);
        assert!(fx.rooms.join(&c, "general").await.is_err());
        assert_eq!(fx.rooms.member_count("general"), 0);
    }

    async fn set_presence(fx: &Fixture, enabled: bool) {
        fx.rooms
            .directory()
            .update(
                "general",
                RoomUpdate {
                    features: Some(RoomFeatures {
                        presence: enabled,
                        ..RoomFeatures::default()
                    }),
                    ..RoomUpdate::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_presence_toggled_between_join_and_leave() {
        let fx = fixture().await;
        let (first, _c1) = open(&fx, "c1", Identity::user("alice")).await;
        fx.rooms.join(&first, "general").await.unwrap();

        // Counted at join, so the leave must uncount it.
        set_presence(&fx, false).await;
        fx.rooms.leave(&first, "general").await.unwrap();
        let record = fx.presence.get("alice", "general").unwrap();
        assert_eq!(record.connection_count, 0);
        assert_eq!(record.status, PresenceStatus::Offline);

        // Rejoin counted, then a second connection joins uncounted.
        set_presence(&fx, true).await;
        fx.rooms.join(&first, "general").await.unwrap();
        set_presence(&fx, false).await;
        let (second, _c2) = open(&fx, "c2", Identity::user("alice")).await;
        fx.rooms.join(&second, "general").await.unwrap();

        // Leaving the uncounted membership leaves alice online.
        set_presence(&fx, true).await;
        fx.rooms.leave(&second, "general").await.unwrap();
        let record = fx.presence.get("alice", "general").unwrap();
        assert_eq!(record.connection_count, 1);
        assert_eq!(record.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_typing_requires_feature() {
        let fx = fixture().await;
        let (c, _ch) = open(&fx, "c1", Identity::user("alice")).await;

        assert!(matches!(
            fx.rooms.typing(&c, "general", true).await,
            Err(CoreError::NotSubscribed(_))
        ));
        fx.rooms.join(&c, "general").await.unwrap();
        fx.rooms.typing(&c, "general", true).await.unwrap();

        fx.rooms
            .directory()
            .update(
                "general",
                RoomUpdate {
                    features: Some(RoomFeatures {
                        typing: false,
                        ..RoomFeatures::default()
                    }),
                    ..RoomUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            fx.rooms.typing(&c, "general", false).await,
            Err(CoreError::FeatureDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_update_presence_across_rooms() {
        let fx = fixture().await;
        fx.rooms.directory().create(RoomSpec::public("random")).await.unwrap();
        let (c, _ch) = open(&fx, "c1", Identity::user("alice")).await;

        assert!(fx
            .rooms
            .update_presence(&c, PresenceStatus::Away, None)
            .await
            .is_err());

        fx.rooms.join(&c, "general").await.unwrap();
        fx.rooms.join(&c, "random").await.unwrap();
        let updated = fx
            .rooms
            .update_presence(&c, PresenceStatus::Busy, Some("focus".into()))
            .await
            .unwrap();
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|r| r.status == PresenceStatus::Busy));
    }
}
