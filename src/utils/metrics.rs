//! Session Metrics
//!
//! Atomic counters kept per session and per server. Cheap to bump from the
//! send and receive workers; read through [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for one session, or aggregated by a server
#[derive(Debug)]
pub struct Metrics {
    /// Connections established
    pub connections_total: AtomicU64,
    /// Currently connected
    pub connections_active: AtomicU64,
    /// Packets written to the socket
    pub packets_sent: AtomicU64,
    /// Packets handed to the handler
    pub packets_received: AtomicU64,
    /// Bytes written by the send worker
    pub bytes_sent: AtomicU64,
    /// Bytes read by the receive worker
    pub bytes_received: AtomicU64,
    /// Stream payload bytes written
    pub stream_bytes_sent: AtomicU64,
    /// Stream payload bytes delivered
    pub stream_bytes_received: AtomicU64,
    /// Pings queued by the keepalive
    pub pings_sent: AtomicU64,
    /// Disconnects caused by send or receive faults
    pub faults: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            stream_bytes_sent: AtomicU64::new(0),
            stream_bytes_received: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate so a stray close never wraps the gauge
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn stream_sent(&self, byte_count: u64) {
        self.stream_bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn stream_received(&self, byte_count: u64) {
        self.stream_bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            stream_bytes_sent: self.stream_bytes_sent.load(Ordering::Relaxed),
            stream_bytes_received: self.stream_bytes_received.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self, session_id: u64) {
        let snapshot = self.snapshot();
        info!(
            session_id,
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            stream_bytes_sent = snapshot.stream_bytes_sent,
            stream_bytes_received = snapshot.stream_bytes_received,
            pings_sent = snapshot.pings_sent,
            faults = snapshot.faults,
            uptime_seconds = snapshot.uptime_seconds,
            "Session metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub stream_bytes_sent: u64,
    pub stream_bytes_received: u64,
    pub pings_sent: u64,
    pub faults: u64,
    pub uptime_seconds: u64,
}
