//! Metrics instrumentation.
//!
//! Recorded through the `metrics` facade; the server binary installs the
//! Prometheus exporter and calls [`describe`].

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "switchboard_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
    pub const CONNECTION_DURATION_SECONDS: &str = "switchboard_connection_duration_seconds";
    pub const REJECTIONS_TOTAL: &str = "switchboard_rejections_total";
    pub const FRAMES_TOTAL: &str = "switchboard_frames_total";
    pub const FRAME_BYTES: &str = "switchboard_frame_bytes";
    pub const MESSAGES_TOTAL: &str = "switchboard_messages_total";
    pub const ROOM_JOINS_TOTAL: &str = "switchboard_room_joins_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "switchboard_subscriptions_total";
    pub const DISPATCH_SECONDS: &str = "switchboard_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
    pub const RETENTION_PURGED_TOTAL: &str = "switchboard_retention_purged_total";
    pub const BROKER_FAILURES_TOTAL: &str = "switchboard_broker_failures_total";
    pub const LIMITER_KEYS_PRUNED_TOTAL: &str = "switchboard_limiter_keys_pruned_total";
}

/// Register descriptions for every metric.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Currently open connections");
    metrics::describe_histogram!(
        names::CONNECTION_DURATION_SECONDS,
        "Lifetime of closed connections in seconds"
    );
    metrics::describe_counter!(
        names::REJECTIONS_TOTAL,
        "Admission rejections by stage and close code"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames processed by direction");
    metrics::describe_counter!(names::FRAME_BYTES, "Frame bytes processed by direction");
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Messages sent by destination kind and final status"
    );
    metrics::describe_counter!(names::ROOM_JOINS_TOTAL, "Successful room joins");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Event-topic and room subscriptions"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Time to dispatch one inbound frame in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Error frames sent, by code");
    metrics::describe_counter!(
        names::RETENTION_PURGED_TOTAL,
        "Messages deleted or expired by the retention sweep"
    );
    metrics::describe_counter!(
        names::BROKER_FAILURES_TOTAL,
        "Broker publishes that failed or timed out, by caller"
    );
    metrics::describe_counter!(
        names::LIMITER_KEYS_PRUNED_TOTAL,
        "Idle rate-limit keys dropped by the maintenance sweep"
    );
}

pub fn set_active_connections(count: usize) {
    gauge!(names::CONNECTIONS_ACTIVE).set(count as f64);
}

/// Record an admission rejection.
pub fn record_rejection(stage: &'static str, code: u16) {
    counter!(names::REJECTIONS_TOTAL, "stage" => stage, "code" => code.to_string()).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a sent message.
pub fn record_message(destination: &'static str, status: &'static str) {
    counter!(names::MESSAGES_TOTAL, "destination" => destination, "status" => status).increment(1);
}

pub fn record_room_join() {
    counter!(names::ROOM_JOINS_TOTAL).increment(1);
}

pub fn record_subscription(kind: &'static str) {
    counter!(names::SUBSCRIPTIONS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_dispatch(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record an error frame.
pub fn record_error(code: &'static str) {
    counter!(names::ERRORS_TOTAL, "code" => code).increment(1);
}

pub fn record_retention(kind: &'static str, count: usize) {
    counter!(names::RETENTION_PURGED_TOTAL, "kind" => kind).increment(count as u64);
}

pub fn record_broker_failure(caller: &'static str) {
    counter!(names::BROKER_FAILURES_TOTAL, "caller" => caller).increment(1);
}

pub fn record_limiter_pruned(count: usize) {
    counter!(names::LIMITER_KEYS_PRUNED_TOTAL).increment(count as u64);
}

/// Records an admitted connection, and its lifetime on drop.
pub struct ConnectionMetricsGuard {
    opened: Instant,
}

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        Self {
            opened: Instant::now(),
        }
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        histogram!(names::CONNECTION_DURATION_SECONDS).record(self.opened.elapsed().as_secs_f64());
    }
}
