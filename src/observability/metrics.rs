//! Lock-free counters for the transport path
//!
//! Counters are plain atomics so the drain task, the coordinator and the
//! producers can update them without coordination.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Which outbound queue a queue counter refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Location,
    Generic,
}

pub struct MetricsCollector {
    // Outbound queues
    location_enqueued: AtomicU64,
    location_dropped: AtomicU64,
    generic_enqueued: AtomicU64,
    generic_dropped: AtomicU64,

    // Broker link
    link_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    // Bus
    bus_publish_timeouts: AtomicU64,
    fatal_escalations: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            location_enqueued: AtomicU64::new(0),
            location_dropped: AtomicU64::new(0),
            generic_enqueued: AtomicU64::new(0),
            generic_dropped: AtomicU64::new(0),
            link_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            bus_publish_timeouts: AtomicU64::new(0),
            fatal_escalations: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn item_enqueued(&self, kind: QueueKind) {
        match kind {
            QueueKind::Location => self.location_enqueued.fetch_add(1, Ordering::Relaxed),
            QueueKind::Generic => self.generic_enqueued.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn item_dropped(&self, kind: QueueKind) {
        match kind {
            QueueKind::Location => self.location_dropped.fetch_add(1, Ordering::Relaxed),
            QueueKind::Generic => self.generic_dropped.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_publish_timeout(&self) {
        self.bus_publish_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fatal_escalated(&self) {
        self.fatal_escalations.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.link_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start == 0 {
            0
        } else {
            now.saturating_sub(start)
        }
    }

    /// Take a consistent-enough copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        MetricsSnapshot {
            queues: QueueMetrics {
                location_enqueued: self.location_enqueued.load(Ordering::Relaxed),
                location_dropped: self.location_dropped.load(Ordering::Relaxed),
                generic_enqueued: self.generic_enqueued.load(Ordering::Relaxed),
                generic_dropped: self.generic_dropped.load(Ordering::Relaxed),
            },
            link: LinkMetrics {
                connected: self.link_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            bus: BusMetrics {
                publish_timeouts: self.bus_publish_timeouts.load(Ordering::Relaxed),
                fatal_escalations: self.fatal_escalations.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub queues: QueueMetrics,
    pub link: LinkMetrics,
    pub bus: BusMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct QueueMetrics {
    pub location_enqueued: u64,
    pub location_dropped: u64,
    pub generic_enqueued: u64,
    pub generic_dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct LinkMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct BusMetrics {
    pub publish_timeouts: u64,
    pub fatal_escalations: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_queue_counters_are_per_kind() {
        let collector = MetricsCollector::new();
        collector.item_enqueued(QueueKind::Location);
        collector.item_enqueued(QueueKind::Location);
        collector.item_dropped(QueueKind::Generic);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.queues.location_enqueued, 2);
        assert_eq!(snapshot.queues.location_dropped, 0);
        assert_eq!(snapshot.queues.generic_enqueued, 0);
        assert_eq!(snapshot.queues.generic_dropped, 1);
    }

    #[test]
    fn test_link_lifecycle() {
        let collector = MetricsCollector::new();
        collector.connection_attempt();
        collector.connection_established();
        collector.message_published();
        collector.publish_failed();

        let snapshot = collector.snapshot();
        assert!(snapshot.link.connected);
        assert_eq!(snapshot.link.connection_attempts, 1);
        assert_eq!(snapshot.link.connections_established, 1);
        assert_eq!(snapshot.link.messages_published, 1);
        assert_eq!(snapshot.link.publish_failures, 1);

        collector.connection_lost();
        let snapshot = collector.snapshot();
        assert!(!snapshot.link.connected);
        assert_eq!(snapshot.link.connections_lost, 1);
        assert_eq!(snapshot.link.connection_duration_seconds, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let collector = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.message_published();
                        collector.item_enqueued(QueueKind::Generic);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.link.messages_published, 800);
        assert_eq!(snapshot.queues.generic_enqueued, 800);
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = MetricsCollector::new();
        collector.bus_publish_timeout();
        collector.fatal_escalated();
        let json = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(json["bus"]["publish_timeouts"], 1);
        assert_eq!(json["bus"]["fatal_escalations"], 1);
    }

    #[test]
    fn test_global_collector_is_shared() {
        let before = metrics().snapshot().bus.publish_timeouts;
        metrics().bus_publish_timeout();
        assert!(metrics().snapshot().bus.publish_timeouts > before);
    }
}
