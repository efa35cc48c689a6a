//! Loading and saving the `{"hosts": {...}, "stats": {...}}` snapshot file.

pub mod stats;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::routing::{Route, RoutingTable};
use stats::{HostStatsSnapshot, StatsRegistry};

#[derive(Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    hosts: HashMap<String, Route>,
    #[serde(default)]
    stats: HashMap<String, HostStatsSnapshot>,
}

/// Loads the routing table and stats registry from `path`.
///
/// A missing file is not an error: the balancer starts with an empty table,
/// matching a fresh install. A malformed file is an error; the caller
/// decides whether that's fatal.
pub fn load(path: &Path) -> anyhow::Result<(RoutingTable, StatsRegistry)> {
    if !path.exists() {
        info!(
            component = "state",
            event = "no_existing_state",
            path = %path.display(),
            "no persisted state found, starting empty"
        );
        return Ok((RoutingTable::new(), StatsRegistry::new()));
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok((RoutingTable::new(), StatsRegistry::new()));
    }

    let persisted: PersistedState = serde_json::from_str(&raw)
        .with_context(|| format!("parsing state file {}", path.display()))?;

    let table = RoutingTable::from_map(persisted.hosts);
    let stats_registry = StatsRegistry::new();
    stats_registry.restore(persisted.stats);

    // Routes loaded from disk still need their health-checkers started.
    for (_, route) in table.snapshot() {
        if route.params.default_healthcheck_enabled() {
            for backend in route.params.backends() {
                backend.start_health_check();
            }
        }
    }

    Ok((table, stats_registry))
}

/// Atomically writes the current routing table and stats to `path` (write
/// to a temp file in the same directory, then rename over the target).
pub fn save(path: &Path, table: &RoutingTable, stats_registry: &StatsRegistry) -> anyhow::Result<()> {
    let persisted = PersistedState {
        hosts: table.snapshot(),
        stats: stats_registry.snapshot(),
    };
    let body = serde_json::to_string_pretty(&persisted).context("serializing state")?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, body)
        .with_context(|| format!("writing temp state file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;

    Ok(())
}

/// Periodically saves state if the routing table has changed since the last
/// save, using a cheap structural hash rather than a deep comparison.
pub async fn save_loop(
    path: std::path::PathBuf,
    table: std::sync::Arc<RoutingTable>,
    stats_registry: std::sync::Arc<StatsRegistry>,
    interval: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_snapshot(table: &RoutingTable) -> u64 {
        let snapshot = table.snapshot();
        let mut keys: Vec<&String> = snapshot.keys().collect();
        keys.sort();
        let mut hasher = DefaultHasher::new();
        for key in keys {
            key.hash(&mut hasher);
            let route = &snapshot[key];
            route.params.kind_str().hash(&mut hasher);
            route.allow_subdomains.hash(&mut hasher);
            for backend in route.params.backends() {
                backend.address_repr().hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    let mut last_hash = hash_snapshot(&table);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                if let Err(e) = save(&path, &table, &stats_registry) {
                    warn!(component = "state", event = "final_save_failed", error = %e, "failed to save state on shutdown");
                }
                return;
            }
        }

        let next_hash = hash_snapshot(&table);
        if next_hash != last_hash {
            match save(&path, &table, &stats_registry) {
                Ok(()) => last_hash = next_hash,
                Err(e) => warn!(component = "state", event = "save_failed", error = %e, "failed to save state"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::routing::{Algorithm, ProxyParams, RouteParams};
    use std::time::Duration;

    #[test]
    fn missing_file_yields_empty_state() {
        let path = std::env::temp_dir().join("vhostlb-test-missing-state.json");
        let _ = std::fs::remove_file(&path);
        let (table, stats_registry) = load(&path).unwrap();
        assert!(table.snapshot().is_empty());
        assert!(stats_registry.snapshot().is_empty());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = std::env::temp_dir().join(format!("vhostlb-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let table = RoutingTable::new();
        table.set(
            "example.test",
            Route::new(
                RouteParams::Proxy(ProxyParams {
                    backends: vec![Backend::new("a", 1)],
                    algorithm: Algorithm::Random,
                    healthcheck: false,
                    attempts: 2,
                    delay: Duration::from_secs(1),
                }),
                true,
            ),
        );
        let stats_registry = StatsRegistry::new();
        stats_registry.close_request("example.test", 10, 20);

        save(&path, &table, &stats_registry).unwrap();
        let (loaded_table, loaded_stats) = load(&path).unwrap();

        assert!(loaded_table.get("example.test").is_some());
        let stats = loaded_stats.get("example.test").unwrap();
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.open_requests, 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
