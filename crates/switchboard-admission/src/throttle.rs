//! Per-identity concurrent connection ceiling.
//!
//! The throttle hands out a [`ConnectionPermit`] for every admitted
//! connection. The permit is held for the connection's lifetime and releases
//! its slot on drop, so counts cannot leak when a session task ends early.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Counts open connections per throttle key.
#[derive(Debug, Default, Clone)]
pub struct ConnectionThrottle {
    counts: Arc<DashMap<String, usize>>,
}

impl ConnectionThrottle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `key` if fewer than `max` are held.
    ///
    /// Returns `None` when the ceiling is reached; existing holders are never evicted.
    #[must_use]
    pub fn try_acquire(&self, key: &str, max: usize) -> Option<ConnectionPermit> {
        let mut count = self.counts.entry(key.to_string()).or_insert(0);
        if *count >= max {
            debug!(key = %key, count = *count, max, "Connection ceiling reached");
            return None;
        }
        *count += 1;
        drop(count);

        Some(ConnectionPermit {
            counts: Arc::clone(&self.counts),
            key: key.to_string(),
        })
    }

    /// Slots currently held for `key`.
    #[must_use]
    pub fn held(&self, key: &str) -> usize {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// A held connection slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    counts: Arc<DashMap<String, usize>>,
    key: String,
}

impl ConnectionPermit {
    /// The throttle key this permit counts against.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        // The entry may have been re-acquired between the two locks.
        let emptied = self
            .counts
            .get_mut(&self.key)
            .map(|mut count| {
                *count = count.saturating_sub(1);
                *count == 0
            })
            .unwrap_or(false);
        if emptied {
            self.counts.remove_if(&self.key, |_, count| *count == 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_rejects_new_connection() {
        let throttle = ConnectionThrottle::new();
        let permits: Vec<_> = (0..5)
            .map(|_| throttle.try_acquire("user:alice", 5).unwrap())
            .collect();

        assert!(throttle.try_acquire("user:alice", 5).is_none());
        assert_eq!(throttle.held("user:alice"), 5);
        // Other keys are unaffected.
        assert!(throttle.try_acquire("user:bob", 5).is_some());

        drop(permits);
        assert_eq!(throttle.held("user:alice"), 0);
    }

    #[test]
    fn test_drop_frees_slot() {
        let throttle = ConnectionThrottle::new();
        let first = throttle.try_acquire("addr:10.0.0.1", 1).unwrap();
        assert_eq!(first.key(), "addr:10.0.0.1");
        assert!(throttle.try_acquire("addr:10.0.0.1", 1).is_none());

        drop(first);
        assert!(throttle.try_acquire("addr:10.0.0.1", 1).is_some());
    }

    #[test]
    fn test_concurrent_acquire_respects_ceiling() {
        let throttle = ConnectionThrottle::new();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let throttle = throttle.clone();
                std::thread::spawn(move || throttle.try_acquire("shared", 5))
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 5);
    }
}
