//! Pub/sub fan-out.
//!
//! A broker delivers an event to every subscriber of a named group. Groups are
//! plain strings; the core uses three namespaces:
//!
//! - `room:<name>` - live members of a room
//! - `user:<id>` - every open connection of one user (direct messages)
//! - `topic:<pattern>` - event-topic subscribers

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use switchboard_protocol::OutboundFrame;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default broadcast capacity per group.
pub const DEFAULT_GROUP_CAPACITY: usize = 1024;

/// An event as it travels through the broker.
pub type Event = Arc<OutboundFrame>;

/// Broker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker cannot accept work.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Subscriber is not in the group.
    #[error("Not subscribed to group: {0}")]
    NotSubscribed(String),
}

/// Group for a room's live members.
#[must_use]
pub fn room_group(room: &str) -> String {
    format!("room:{}", room)
}

/// Group for every connection of one user.
#[must_use]
pub fn user_group(user: &str) -> String {
    format!("user:{}", user)
}

/// Group for subscribers of a topic pattern.
#[must_use]
pub fn topic_group(pattern: &str) -> String {
    format!("topic:{}", pattern)
}

/// Pub/sub fan-out to named groups.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Deliver `event` to every current subscriber of `group`.
    ///
    /// Returns the number of subscribers that were handed the event;
    /// publishing to a group without subscribers returns `Ok(0)`.
    async fn publish(&self, group: &str, event: Event) -> Result<usize, BrokerError>;

    /// Add `subscriber` to `group` and return its event stream.
    ///
    /// Subscribing twice replaces the previous stream.
    async fn subscribe(
        &self,
        group: &str,
        subscriber: &str,
    ) -> Result<broadcast::Receiver<Event>, BrokerError>;

    /// Remove `subscriber` from `group`.
    async fn unsubscribe(&self, group: &str, subscriber: &str) -> Result<(), BrokerError>;

    /// Remove `subscriber` from every group.
    async fn unsubscribe_all(&self, subscriber: &str);

    /// Names of groups that currently have subscribers.
    async fn groups(&self) -> Vec<String>;
}

/// A group's sender and subscriber set.
#[derive(Debug)]
struct Group {
    sender: broadcast::Sender<Event>,
    subscribers: HashSet<String>,
}

impl Group {
    fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub group_count: usize,
    pub subscriber_count: usize,
    pub total_subscriptions: usize,
}

/// In-process broker backed by one `tokio::sync::broadcast` channel per group.
///
/// Empty groups are deleted as soon as their last subscriber leaves.
#[derive(Debug)]
pub struct InMemoryBroker {
    groups: DashMap<String, Group>,
    /// subscriber -> groups it belongs to
    memberships: DashMap<String, DashSet<String>>,
    capacity: usize,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GROUP_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            groups: DashMap::new(),
            memberships: DashMap::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            group_count: self.groups.len(),
            subscriber_count: self.memberships.len(),
            total_subscriptions: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }

    /// Subscribers of `group`.
    #[must_use]
    pub fn subscribers(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|g| g.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn leave(&self, group: &str, subscriber: &str) -> bool {
        let Some(mut entry) = self.groups.get_mut(group) else {
            return false;
        };
        let removed = entry.subscribers.remove(subscriber);
        if entry.subscribers.is_empty() {
            drop(entry); // Release the lock
            self.groups.remove_if(group, |_, g| g.subscribers.is_empty());
            debug!(group = %group, "Deleted empty group");
        }
        removed
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, group: &str, event: Event) -> Result<usize, BrokerError> {
        let Some(entry) = self.groups.get(group) else {
            trace!(group = %group, "Publish to group without subscribers");
            return Ok(0);
        };
        // A send error only means every receiver is gone.
        let count = entry.sender.send(event).unwrap_or_default();
        trace!(group = %group, recipients = count, "Published event");
        Ok(count)
    }

    async fn subscribe(
        &self,
        group: &str,
        subscriber: &str,
    ) -> Result<broadcast::Receiver<Event>, BrokerError> {
        let mut entry = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| {
                debug!(group = %group, "Creating new group");
                Group::with_capacity(self.capacity)
            });
        entry.subscribers.insert(subscriber.to_string());
        let receiver = entry.sender.subscribe();
        drop(entry);

        self.memberships
            .entry(subscriber.to_string())
            .or_default()
            .insert(group.to_string());

        debug!(group = %group, subscriber = %subscriber, "Subscribed");
        Ok(receiver)
    }

    async fn unsubscribe(&self, group: &str, subscriber: &str) -> Result<(), BrokerError> {
        let member = self
            .memberships
            .get(subscriber)
            .map(|groups| groups.remove(group).is_some())
            .unwrap_or(false);
        self.memberships
            .remove_if(subscriber, |_, groups| groups.is_empty());

        if !member || !self.leave(group, subscriber) {
            return Err(BrokerError::NotSubscribed(group.to_string()));
        }
        debug!(group = %group, subscriber = %subscriber, "Unsubscribed");
        Ok(())
    }

    async fn unsubscribe_all(&self, subscriber: &str) {
        if let Some((_, groups)) = self.memberships.remove(subscriber) {
            for group in groups.iter() {
                self.leave(group.as_str(), subscriber);
            }
        }
        debug!(subscriber = %subscriber, "Unsubscribed from all groups");
    }

    async fn groups(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().clone()).collect()
    }
}
