//! Per-host traffic counters, keyed by matched host (as in the persisted
//! state file's `"stats"` object).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Live, atomically-updated counters for one matched host.
#[derive(Default)]
pub struct HostStats {
    open_requests: AtomicI64,
    completed_requests: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl HostStats {
    pub fn open_request(&self) {
        self.open_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close_request(&self, bytes_sent: u64, bytes_received: u64) {
        self.open_requests.fetch_sub(1, Ordering::Relaxed);
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_received, Ordering::Relaxed);
    }

    /// Adds to the byte counters without touching the request counters.
    /// Used mid-request, e.g. when a proxied request forwards a prefix of
    /// bytes to the backend before the response is known.
    pub fn add_bytes(&self, bytes_sent: u64, bytes_received: u64) {
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_received, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HostStatsSnapshot {
        HostStatsSnapshot {
            open_requests: self.open_requests.load(Ordering::Relaxed).max(0) as u64,
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn restore(snapshot: &HostStatsSnapshot) -> Self {
        Self {
            // open_requests is always zeroed on load: a persisted snapshot
            // can never have genuinely in-flight requests.
            open_requests: AtomicI64::new(0),
            completed_requests: AtomicU64::new(snapshot.completed_requests),
            bytes_sent: AtomicU64::new(snapshot.bytes_sent),
            bytes_received: AtomicU64::new(snapshot.bytes_received),
        }
    }
}

/// The JSON-serializable form of [`HostStats`], matching the persisted
/// state file schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostStatsSnapshot {
    #[serde(default)]
    pub open_requests: u64,
    #[serde(default)]
    pub completed_requests: u64,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
}

/// Registry of per-host stats, one entry created lazily per matched host.
#[derive(Default)]
pub struct StatsRegistry {
    hosts: DashMap<String, HostStats>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_request(&self, matched_host: &str) {
        self.hosts
            .entry(matched_host.to_string())
            .or_default()
            .open_request();
    }

    pub fn close_request(&self, matched_host: &str, bytes_sent: u64, bytes_received: u64) {
        self.hosts
            .entry(matched_host.to_string())
            .or_default()
            .close_request(bytes_sent, bytes_received);
    }

    pub fn add_bytes(&self, matched_host: &str, bytes_sent: u64, bytes_received: u64) {
        self.hosts
            .entry(matched_host.to_string())
            .or_default()
            .add_bytes(bytes_sent, bytes_received);
    }

    pub fn snapshot(&self) -> std::collections::HashMap<String, HostStatsSnapshot> {
        self.hosts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn get(&self, matched_host: &str) -> Option<HostStatsSnapshot> {
        self.hosts.get(matched_host).map(|s| s.snapshot())
    }

    /// Replaces the registry's contents with a loaded snapshot. Used once at
    /// startup; `open_requests` is always reset to zero regardless of what
    /// was persisted.
    pub fn restore(&self, snapshot: std::collections::HashMap<String, HostStatsSnapshot>) {
        self.hosts.clear();
        for (host, stats) in snapshot {
            self.hosts.insert(host, HostStats::restore(&stats));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_close_request_updates_counters() {
        let registry = StatsRegistry::new();
        registry.open_request("example.test");
        let mid = registry.get("example.test").unwrap();
        assert_eq!(mid.open_requests, 1);

        registry.close_request("example.test", 100, 50);
        let after = registry.get("example.test").unwrap();
        assert_eq!(after.open_requests, 0);
        assert_eq!(after.completed_requests, 1);
        assert_eq!(after.bytes_sent, 100);
        assert_eq!(after.bytes_received, 50);
    }

    #[test]
    fn restore_zeroes_open_requests() {
        let registry = StatsRegistry::new();
        let mut snapshot = std::collections::HashMap::new();
        snapshot.insert(
            "example.test".to_string(),
            HostStatsSnapshot {
                open_requests: 7,
                completed_requests: 3,
                bytes_sent: 10,
                bytes_received: 20,
            },
        );
        registry.restore(snapshot);
        let restored = registry.get("example.test").unwrap();
        assert_eq!(restored.open_requests, 0);
        assert_eq!(restored.completed_requests, 3);
    }
}
