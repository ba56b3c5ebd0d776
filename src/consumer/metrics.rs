//! Pipeline metrics collection

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pipeline counters, shared by every session of a supervisor
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    /// Messages read from claims
    pub messages_received: Arc<AtomicU64>,
    /// Record groups handed to the sink
    pub groups_submitted: Arc<AtomicU64>,
    /// Groups confirmed delivered (offset marked)
    pub groups_delivered: Arc<AtomicU64>,
    /// Groups reported undelivered
    pub groups_undelivered: Arc<AtomicU64>,
    /// Messages rejected for exceeding `max_message_len`
    pub messages_oversize: Arc<AtomicU64>,
    /// Messages the parser rejected
    pub parse_failures: Arc<AtomicU64>,
    /// Delivery results for unknown tracking ids
    pub unknown_deliveries: Arc<AtomicU64>,
    /// Sessions started
    pub sessions_started: Arc<AtomicU64>,
    /// Consume attempts that failed
    pub consume_errors: Arc<AtomicU64>,
    /// Consumer group swaps after a topic change
    pub group_swaps: Arc<AtomicU64>,
    start_time: Instant,
}

impl ConsumerMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            messages_received: Arc::new(AtomicU64::new(0)),
            groups_submitted: Arc::new(AtomicU64::new(0)),
            groups_delivered: Arc::new(AtomicU64::new(0)),
            groups_undelivered: Arc::new(AtomicU64::new(0)),
            messages_oversize: Arc::new(AtomicU64::new(0)),
            parse_failures: Arc::new(AtomicU64::new(0)),
            unknown_deliveries: Arc::new(AtomicU64::new(0)),
            sessions_started: Arc::new(AtomicU64::new(0)),
            consume_errors: Arc::new(AtomicU64::new(0)),
            group_swaps: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Count a consumed message
    pub fn increment_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a record group handed to the sink
    pub fn increment_submitted(&self) {
        self.groups_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery result
    pub fn record_delivery(&self, delivered: bool) {
        if delivered {
            self.groups_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.groups_undelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a message skipped for its size
    pub fn increment_oversize(&self) {
        self.messages_oversize.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a payload that failed to parse
    pub fn increment_parse_failures(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a delivery result for an unknown tracking id
    pub fn increment_unknown_deliveries(&self) {
        self.unknown_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a started session
    pub fn increment_sessions(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed join or consume attempt
    pub fn increment_consume_errors(&self) {
        self.consume_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a consumer group replaced after a topic change
    pub fn increment_group_swaps(&self) {
        self.group_swaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the collector was created
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            groups_submitted: self.groups_submitted.load(Ordering::Relaxed),
            groups_delivered: self.groups_delivered.load(Ordering::Relaxed),
            groups_undelivered: self.groups_undelivered.load(Ordering::Relaxed),
            messages_oversize: self.messages_oversize.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            unknown_deliveries: self.unknown_deliveries.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            consume_errors: self.consume_errors.load(Ordering::Relaxed),
            group_swaps: self.group_swaps.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics snapshot for logging or export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Messages consumed
    pub messages_received: u64,
    /// Record groups handed to the sink
    pub groups_submitted: u64,
    /// Record groups confirmed delivered
    pub groups_delivered: u64,
    /// Record groups reported undelivered
    pub groups_undelivered: u64,
    /// Messages skipped for exceeding the size limit
    pub messages_oversize: u64,
    /// Payloads that failed to parse
    pub parse_failures: u64,
    /// Delivery results for unknown tracking ids
    pub unknown_deliveries: u64,
    /// Sessions started
    pub sessions_started: u64,
    /// Failed join or consume attempts
    pub consume_errors: u64,
    /// Consumer groups replaced after a topic change
    pub group_swaps: u64,
    /// Seconds since the collector was created
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ConsumerMetrics::new();
        let shared = metrics.clone();

        metrics.increment_received();
        metrics.increment_received();
        shared.increment_submitted();
        shared.record_delivery(true);
        shared.record_delivery(false);
        metrics.increment_oversize();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.groups_submitted, 1);
        assert_eq!(snapshot.groups_delivered, 1);
        assert_eq!(snapshot.groups_undelivered, 1);
        assert_eq!(snapshot.messages_oversize, 1);
        assert_eq!(snapshot.unknown_deliveries, 0);
    }
}
