//! Lightweight server metrics: atomic counters, a session gauge and uptime.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Process-wide counters. Incremented lock-free from listener tasks.
pub struct Metrics {
    http: AtomicU64,
    dns: AtomicU64,
    smtp: AtomicU64,
    /// Gauge of registered clients: bumped on register, dropped on
    /// deregister, independent of whether storage agreed.
    sessions: AtomicI64,
    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            http: AtomicU64::new(0),
            dns: AtomicU64::new(0),
            smtp: AtomicU64::new(0),
            sessions: AtomicI64::new(0),
            started: Instant::now(),
        }
    }

    pub fn incr_http(&self) {
        self.http.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dns(&self) {
        self.dns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_smtp(&self) {
        self.smtp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_sessions(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_sessions(&self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache: CacheStats) -> MetricsSnapshot {
        MetricsSnapshot {
            http: self.http.load(Ordering::Relaxed),
            dns: self.dns.load(Ordering::Relaxed),
            smtp: self.smtp.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
            cache,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage-side view reported in the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    /// Currently registered client entries.
    pub live_entries: u64,
    /// Literal-key channels (root-TLD, auth token) with pending data.
    pub live_channels: u64,
    /// Entries removed by TTL expiry or ring overflow since boot.
    pub evictions: u64,
}

/// Aggregate view served by `/metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub http: u64,
    pub dns: u64,
    pub smtp: u64,
    pub sessions: i64,
    pub uptime_seconds: u64,
    pub cache: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_gauge_can_go_negative() {
        let metrics = Metrics::new();
        metrics.decr_sessions();
        let snap = metrics.snapshot(CacheStats::default());
        assert_eq!(snap.sessions, -1);
    }

    #[test]
    fn snapshot_serialises_counters() {
        let metrics = Metrics::new();
        metrics.incr_http();
        metrics.incr_http();
        metrics.incr_dns();
        let snap = metrics.snapshot(CacheStats {
            live_entries: 3,
            live_channels: 1,
            evictions: 0,
        });
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["http"], 2);
        assert_eq!(json["dns"], 1);
        assert_eq!(json["cache"]["live_entries"], 3);
    }
}
