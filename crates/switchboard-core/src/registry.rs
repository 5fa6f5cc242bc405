//! The connection registry.
//!
//! Owns every open [`ConnectionHandle`], indexed by connection id and by user.
//! Broker subscriptions for a connection are made here so the registry can
//! tear all of them down when the connection goes away.

use crate::broker::{topic_group, user_group, Broker, BrokerError};
use crate::connection::{ConnectionHandle, ConnectionInfo, ConnectionState};
use crate::error::CoreError;
use crate::metrics;
use dashmap::{DashMap, DashSet};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::CloseCode;
use tracing::{debug, info};

/// Maximum topic pattern length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Default idle time after which a connection is closed as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Validate an event-topic pattern. `*` is only allowed as the last character.
///
/// # Errors
///
/// Returns an error message if the pattern is invalid.
pub fn validate_topic_pattern(pattern: &str) -> Result<(), &'static str> {
    if pattern.is_empty() {
        return Err("Topic cannot be empty");
    }
    if pattern.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if !pattern.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ') {
        return Err("Topic contains invalid characters");
    }
    if pattern[..pattern.len() - 1].contains('*') {
        return Err("Wildcard '*' is only allowed at the end of a topic");
    }
    Ok(())
}

/// Whether `topic` is covered by `pattern` (exact, or prefix when the
/// pattern ends in `*`).
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

/// Admin listing filter. Every set field must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionFilter {
    pub identity: Option<String>,
    pub room: Option<String>,
    pub state: Option<String>,
    pub anonymous: Option<bool>,
    pub remote_addr: Option<String>,
}

impl ConnectionFilter {
    fn matches(&self, conn: &ConnectionHandle) -> bool {
        self.identity.as_deref().map_or(true, |id| conn.label() == id)
            && self.room.as_deref().map_or(true, |room| conn.in_room(room))
            && self
                .state
                .as_deref()
                .map_or(true, |state| conn.state().to_string() == state)
            && self
                .anonymous
                .map_or(true, |anon| conn.identity().is_anonymous() == anon)
            && self
                .remote_addr
                .as_deref()
                .map_or(true, |addr| conn.remote_addr() == addr)
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub identities: usize,
    pub anonymous: usize,
    pub room_subscriptions: usize,
    pub topic_subscriptions: usize,
}

/// Connections indexed by id and by user.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionHandle>>,
    /// user id -> connection ids
    by_identity: DashMap<String, DashSet<String>>,
    broker: Arc<dyn Broker>,
    broker_timeout: Duration,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, broker_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            by_identity: DashMap::new(),
            broker,
            broker_timeout,
        }
    }

    async fn broker_call<T, F>(&self, call: F) -> Result<T, CoreError>
    where
        F: std::future::Future<Output = Result<T, BrokerError>>,
    {
        match tokio::time::timeout(self.broker_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(BrokerError::NotSubscribed(group))) => Err(CoreError::NotSubscribed(group)),
            Ok(Err(e)) => Err(CoreError::BrokerUnavailable(e.to_string())),
            Err(_) => Err(CoreError::BrokerUnavailable("broker timed out".to_string())),
        }
    }

    /// Move an admitted connection to `open` and index it.
    ///
    /// # Errors
    ///
    /// Fails if the handle is no longer `connecting` or the broker cannot
    /// subscribe the user's direct-message group.
    pub async fn register(&self, conn: Arc<ConnectionHandle>) -> Result<(), CoreError> {
        if !conn.transition(ConnectionState::Open) {
            return Err(CoreError::Internal(format!(
                "connection {} is {}",
                conn.id(),
                conn.state()
            )));
        }

        self.connections
            .insert(conn.id().to_string(), Arc::clone(&conn));
        if let Some(user) = conn.identity().user_id() {
            self.by_identity
                .entry(user.to_string())
                .or_default()
                .insert(conn.id().to_string());
            let group = user_group(user);
            if let Err(e) = self.subscribe(&conn, &group).await {
                self.deregister(&conn).await;
                return Err(e);
            }
        }

        metrics::set_active_connections(self.connections.len());
        info!(connection = %conn.id(), identity = %conn.label(), "Connection opened");
        Ok(())
    }

    /// Remove a connection from every index and broker group and mark it closed.
    pub async fn deregister(&self, conn: &ConnectionHandle) {
        self.connections.remove(conn.id());
        if let Some(user) = conn.identity().user_id() {
            if let Some(ids) = self.by_identity.get(user) {
                ids.remove(conn.id());
            }
            self.by_identity.remove_if(user, |_, ids| ids.is_empty());
        }

        self.broker.unsubscribe_all(conn.id()).await;
        conn.rooms_set().clear();
        conn.topics_set().clear();
        conn.release();
        conn.transition(ConnectionState::Closed);

        metrics::set_active_connections(self.connections.len());
        debug!(connection = %conn.id(), "Connection deregistered");
    }

    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(connection_id).map(|c| Arc::clone(&c))
    }

    /// Open connections of a user.
    #[must_use]
    pub fn connections_of(&self, user: &str) -> Vec<Arc<ConnectionHandle>> {
        self.by_identity
            .get(user)
            .map(|ids| ids.iter().filter_map(|id| self.get(id.as_str())).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_online(&self, user: &str) -> bool {
        self.by_identity.contains_key(user)
    }

    /// Snapshot of connections matching `filter`, oldest first.
    #[must_use]
    pub fn list(&self, filter: &ConnectionFilter) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .filter(|c| filter.matches(c.value()))
            .map(|c| c.info())
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }

    /// Every registered connection.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Refresh `last_seen_at` for a connection.
    pub fn touch(&self, connection_id: &str) {
        if let Some(conn) = self.connections.get(connection_id) {
            conn.touch();
        }
    }

    /// Ask a connection's session to close. Idempotent.
    pub fn close(&self, connection_id: &str, code: CloseCode) -> bool {
        self.get(connection_id)
            .map(|conn| conn.request_close(code))
            .unwrap_or(false)
    }

    /// Subscribe a connection to a broker group and forward its events.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BrokerUnavailable`] when the broker fails or times out.
    pub async fn subscribe(&self, conn: &ConnectionHandle, group: &str) -> Result<(), CoreError> {
        let rx = self
            .broker_call(self.broker.subscribe(group, conn.id()))
            .await?;
        conn.attach_forwarder(group, rx);
        Ok(())
    }

    /// Drop a connection's broker subscription.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotSubscribed`] if the connection was not in the group.
    pub async fn unsubscribe(&self, conn: &ConnectionHandle, group: &str) -> Result<(), CoreError> {
        conn.detach_forwarder(group);
        self.broker_call(self.broker.unsubscribe(group, conn.id()))
            .await
    }

    /// Subscribe to an event topic pattern.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed pattern.
    pub async fn subscribe_topic(
        &self,
        conn: &ConnectionHandle,
        pattern: &str,
    ) -> Result<bool, CoreError> {
        validate_topic_pattern(pattern).map_err(|e| CoreError::Validation(e.to_string()))?;
        if !conn.topics_set().insert(pattern.to_string()) {
            return Ok(false);
        }
        if let Err(e) = self.subscribe(conn, &topic_group(pattern)).await {
            conn.topics_set().remove(pattern);
            return Err(e);
        }
        metrics::record_subscription("topic");
        Ok(true)
    }

    /// Remove an event topic pattern.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotSubscribed`] if the pattern was never subscribed.
    pub async fn unsubscribe_topic(
        &self,
        conn: &ConnectionHandle,
        pattern: &str,
    ) -> Result<(), CoreError> {
        if conn.topics_set().remove(pattern).is_none() {
            return Err(CoreError::NotSubscribed(pattern.to_string()));
        }
        self.unsubscribe(conn, &topic_group(pattern)).await
    }

    /// Close every connection idle for longer than `threshold`.
    ///
    /// Returns the ids that were asked to close.
    pub fn sweep_stale(&self, threshold: Duration) -> Vec<String> {
        let stale: Vec<Arc<ConnectionHandle>> = self
            .connections
            .iter()
            .filter(|c| c.is_open() && c.idle_for() > threshold)
            .map(|c| Arc::clone(c.value()))
            .collect();

        stale
            .into_iter()
            .filter(|conn| conn.request_close(CloseCode::Stale))
            .map(|conn| {
                info!(connection = %conn.id(), idle = ?conn.idle_for(), "Closing stale connection");
                conn.id().to_string()
            })
            .collect()
    }

    /// Ask every connection to close.
    pub fn close_all(&self, code: CloseCode) -> usize {
        self.all()
            .into_iter()
            .filter(|conn| conn.request_close(code))
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            connections: self.connections.len(),
            identities: self.by_identity.len(),
            ..RegistryStats::default()
        };
        for conn in self.connections.iter() {
            if conn.identity().is_anonymous() {
                stats.anonymous += 1;
            }
            stats.room_subscriptions += conn.rooms_set().len();
            stats.topic_subscriptions += conn.topics_set().len();
        }
        stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use switchboard_admission::Identity;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(InMemoryBroker::new()), Duration::from_secs(1))
    }

    fn conn(id: &str, identity: Identity) -> Arc<ConnectionHandle> {
        Arc::new(ConnectionHandle::new(id, identity, "10.0.0.1", "memory").0)
    }

    #[test]
    fn test_topic_patterns() {
        assert!(validate_topic_pattern("orders.created").is_ok());
        assert!(validate_topic_pattern("orders.*").is_ok());
        assert!(validate_topic_pattern("*").is_ok());
        assert!(validate_topic_pattern("").is_err());
        assert!(validate_topic_pattern("or*ders").is_err());
        assert!(validate_topic_pattern("has space").is_err());

        assert!(topic_matches("orders.*", "orders.created"));
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.updated"));
        assert!(topic_matches("*", "anything"));
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let registry = registry();
        let alice = conn("c1", Identity::user("alice"));
        registry.register(Arc::clone(&alice)).await.unwrap();

        assert!(alice.is_open());
        assert!(registry.is_online("alice"));
        assert_eq!(registry.connections_of("alice").len(), 1);
        assert_eq!(registry.stats().identities, 1);

        // A handle can only be opened once.
        assert!(registry.register(Arc::clone(&alice)).await.is_err());

        registry.deregister(&alice).await;
        assert_eq!(alice.state(), ConnectionState::Closed);
        assert!(registry.get("c1").is_none());
        assert!(!registry.is_online("alice"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = registry();
        let c = conn("c1", Identity::Anonymous);
        registry.register(Arc::clone(&c)).await.unwrap();

        assert!(registry.close("c1", CloseCode::ForceDisconnected));
        assert!(!registry.close("c1", CloseCode::ForceDisconnected));
        registry.deregister(&c).await;
        registry.deregister(&c).await;
        assert_eq!(c.state(), ConnectionState::Closed);
        assert!(!registry.close("c1", CloseCode::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_only_idle() {
        let registry = registry();
        let idle = conn("idle", Identity::Anonymous);
        let busy = conn("busy", Identity::Anonymous);
        registry.register(Arc::clone(&idle)).await.unwrap();
        registry.register(Arc::clone(&busy)).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        registry.touch("busy");

        assert_eq!(registry.sweep_stale(DEFAULT_STALE_AFTER), vec!["idle".to_string()]);
        assert_eq!(idle.state(), ConnectionState::Closing);
        assert!(busy.is_open());
        // Already closing: not swept twice.
        assert!(registry.sweep_stale(DEFAULT_STALE_AFTER).is_empty());
    }

    #[tokio::test]
    async fn test_topic_subscriptions() {
        let registry = registry();
        let c = conn("c1", Identity::Anonymous);
        registry.register(Arc::clone(&c)).await.unwrap();

        assert!(registry.subscribe_topic(&c, "orders.*").await.unwrap());
        assert!(!registry.subscribe_topic(&c, "orders.*").await.unwrap());
        assert_eq!(c.topics(), vec!["orders.*".to_string()]);
        assert_eq!(registry.stats().topic_subscriptions, 1);

        registry.unsubscribe_topic(&c, "orders.*").await.unwrap();
        assert!(matches!(
            registry.unsubscribe_topic(&c, "orders.*").await,
            Err(CoreError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filter() {
        let registry = registry();
        registry.register(conn("c1", Identity::user("alice"))).await.unwrap();
        registry.register(conn("c2", Identity::user("bob"))).await.unwrap();
        registry.register(conn("c3", Identity::Anonymous)).await.unwrap();

        let filter = ConnectionFilter {
            identity: Some("alice".into()),
            ..ConnectionFilter::default()
        };
        let found = registry.list(&filter);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].connection_id, "c1");

        let anonymous = ConnectionFilter {
            anonymous: Some(true),
            ..ConnectionFilter::default()
        };
        assert_eq!(registry.list(&anonymous).len(), 1);
        assert_eq!(registry.list(&ConnectionFilter::default()).len(), 3);
    }
}
