//! Observability and Metrics
//!
//! Transport counters for monitoring throughput and connection health.
//!
//! Every `Client` and `Server` owns a [`Metrics`] instance; each update is
//! mirrored into a process-wide aggregate reachable through
//! [`global_metrics`].
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for transport operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connect attempts that never reached the connected state
    pub connect_failures: AtomicU64,
    /// Total messages queued for sending
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total payload bytes queued for sending
    pub bytes_sent: AtomicU64,
    /// Total payload bytes received
    pub bytes_received: AtomicU64,
    /// Socket writes performed by send loops
    pub write_batches: AtomicU64,
    /// Length headers above the configured maximum
    pub protocol_errors: AtomicU64,
    /// Connections dropped because a send or receive queue was full
    pub queue_limit_disconnects: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            write_batches: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            queue_limit_disconnects: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn is_global(&self) -> bool {
        std::ptr::eq(self, global_metrics())
    }

    fn bump(&self, pick: impl Fn(&Metrics) -> &AtomicU64, n: u64) {
        pick(self).fetch_add(n, Ordering::Relaxed);
        if !self.is_global() {
            pick(global_metrics()).fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.bump(|m| &m.connections_total, 1);
        self.bump(|m| &m.connections_active, 1);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        if !self.is_global() {
            global_metrics()
                .connections_active
                .fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Record a failed connect attempt
    pub fn connect_failed(&self) {
        self.bump(|m| &m.connect_failures, 1);
    }

    /// Record a message queued for sending
    pub fn message_sent(&self, byte_count: u64) {
        self.bump(|m| &m.messages_sent, 1);
        self.bump(|m| &m.bytes_sent, byte_count);
    }

    /// Record a message received
    pub fn message_received(&self, byte_count: u64) {
        self.bump(|m| &m.messages_received, 1);
        self.bump(|m| &m.bytes_received, byte_count);
    }

    /// Record one batched socket write
    pub fn write_batch(&self) {
        self.bump(|m| &m.write_batches, 1);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.bump(|m| &m.protocol_errors, 1);
    }

    /// Record a queue limit disconnect
    pub fn queue_limit_disconnect(&self) {
        self.bump(|m| &m.queue_limit_disconnects, 1);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            write_batches: self.write_batches.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            queue_limit_disconnects: self.queue_limit_disconnects.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connect_failures = snapshot.connect_failures,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            write_batches = snapshot.write_batches,
            protocol_errors = snapshot.protocol_errors,
            queue_limit_disconnects = snapshot.queue_limit_disconnects,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connect_failures: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub write_batches: u64,
    pub protocol_errors: u64,
    pub queue_limit_disconnects: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
