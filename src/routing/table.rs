//! The host -> route map, with copy-on-write snapshot reads.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::route::{Route, RouteParams};

/// Maps configured hostnames (optionally protocol-prefixed) to routes.
///
/// Reads take a stable snapshot via `ArcSwap::load`, so a `resolve()` in
/// flight never observes a partially-applied `set`/`delete`.
pub struct RoutingTable {
    hosts: ArcSwap<HashMap<String, Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            hosts: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn from_map(map: HashMap<String, Route>) -> Self {
        Self {
            hosts: ArcSwap::from_pointee(map),
        }
    }

    /// Returns the route registered for the exact key, if any.
    pub fn get(&self, key: &str) -> Option<Route> {
        self.hosts.load().get(key).cloned()
    }

    /// Registers (or replaces) the route for `key`. All of the replaced
    /// route's backends are retired unconditionally -- a reload always
    /// builds brand-new `Backend` objects, so an old entry whose address
    /// happens to match a new one is still a distinct instance with its own
    /// prober task. Backends in the new route start health-checking if the
    /// route enables it.
    pub fn set(&self, key: impl Into<String>, route: Route) {
        let key = key.into();
        let mut next = (**self.hosts.load()).clone();
        let old = next.insert(key, route.clone());

        if let Some(old_route) = old {
            for old_backend in old_route.params.backends() {
                old_backend.retire();
            }
        }

        if route.params.default_healthcheck_enabled() {
            for backend in route.params.backends() {
                backend.start_health_check();
            }
        }

        self.hosts.store(Arc::new(next));
    }

    /// Removes the route registered for `key`, retiring its backends.
    pub fn delete(&self, key: &str) -> Option<Route> {
        let mut next = (**self.hosts.load()).clone();
        let removed = next.remove(key);
        if let Some(route) = &removed {
            for backend in route.params.backends() {
                backend.retire();
            }
        }
        self.hosts.store(Arc::new(next));
        removed
    }

    /// Returns a snapshot of all configured `(host, route)` pairs.
    pub fn snapshot(&self) -> HashMap<String, Route> {
        (**self.hosts.load()).clone()
    }

    /// Resolves `host` (as seen in the `Host`/`LoadBalanceTo` header) for the
    /// given listener `protocol` ("http" or "https").
    ///
    /// Walks from the most specific match (the full host) down to the
    /// top-level domain, peeling off one leftmost label per step. At each
    /// step, a protocol-prefixed key (`"<protocol>://<check>"`) is tried
    /// before the bare key (`"<check>"`). A match at the first step (the
    /// exact host) always wins; a match at a shallower step only wins if
    /// that route allows subdomains.
    ///
    /// Returns the matched key alongside the route, since the caller needs
    /// it for stats attribution (which may differ from the requested host
    /// when a subdomain match occurred). If the table is completely empty,
    /// returns `None` regardless of `host` -- callers treat that as the
    /// no-hosts-configured case.
    pub fn resolve(&self, host: &str, protocol: &str) -> Option<(String, Route)> {
        let snapshot = self.hosts.load();
        if snapshot.is_empty() {
            return None;
        }
        let bits: Vec<&str> = host.split('.').collect();

        for i in 0..bits.len() {
            let check = bits[i..].join(".");
            for key in [format!("{protocol}://{check}"), check.clone()] {
                if let Some(route) = snapshot.get(&key) {
                    if i == 0 || route.allow_subdomains {
                        return Some((key, route.clone()));
                    }
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.load().is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::routing::route::{Algorithm, ProxyParams};
    use std::time::Duration;

    fn proxy_route(backend: Backend, allow_subdomains: bool) -> Route {
        Route::new(
            RouteParams::Proxy(ProxyParams {
                backends: vec![backend],
                algorithm: Algorithm::LeastConnections,
                healthcheck: false,
                attempts: 2,
                delay: Duration::from_secs(1),
            }),
            allow_subdomains,
        )
    }

    #[test]
    fn exact_match_wins_even_without_subdomains_allowed() {
        let table = RoutingTable::new();
        table.set("example.test", proxy_route(Backend::new("a", 1), false));
        assert!(table.resolve("example.test", "http").is_some());
    }

    #[test]
    fn subdomain_requires_allow_subdomains_flag() {
        let table = RoutingTable::new();
        table.set("example.test", proxy_route(Backend::new("a", 1), false));
        assert!(table.resolve("www.example.test", "http").is_none());

        table.set("example.test", proxy_route(Backend::new("a", 1), true));
        assert!(table.resolve("www.example.test", "http").is_some());
    }

    #[test]
    fn protocol_prefixed_key_checked_before_bare_key() {
        let table = RoutingTable::new();
        table.set("example.test", proxy_route(Backend::new("bare", 1), true));
        table.set(
            "https://example.test",
            proxy_route(Backend::new("secure", 2), true),
        );

        let (key, resolved) = table.resolve("example.test", "https").unwrap();
        assert_eq!(key, "https://example.test");
        assert_eq!(resolved.params.backends()[0].host(), "secure");

        let (key_http, resolved_http) = table.resolve("example.test", "http").unwrap();
        assert_eq!(key_http, "example.test");
        assert_eq!(resolved_http.params.backends()[0].host(), "bare");
    }

    #[test]
    fn most_specific_level_wins() {
        let table = RoutingTable::new();
        table.set("test", proxy_route(Backend::new("tld", 1), true));
        table.set("example.test", proxy_route(Backend::new("mid", 2), true));

        let (key, resolved) = table.resolve("www.example.test", "http").unwrap();
        assert_eq!(key, "example.test");
        assert_eq!(resolved.params.backends()[0].host(), "mid");
    }

    #[test]
    fn empty_table_resolves_to_none() {
        let table = RoutingTable::new();
        assert!(table.resolve("anything.test", "http").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn delete_retires_backends() {
        let table = RoutingTable::new();
        let backend = Backend::new("a", 1);
        table.set("example.test", proxy_route(backend.clone(), false));
        assert!(!backend.is_retired());
        table.delete("example.test");
        assert!(backend.is_retired());
    }

    #[test]
    fn replacing_a_route_retires_all_of_its_old_backends() {
        let table = RoutingTable::new();
        let same_address = Backend::new("kept", 1);
        let dropped = Backend::new("dropped", 2);
        table.set(
            "example.test",
            Route::new(
                RouteParams::Proxy(ProxyParams {
                    backends: vec![same_address.clone(), dropped.clone()],
                    algorithm: Algorithm::LeastConnections,
                    healthcheck: false,
                    attempts: 2,
                    delay: Duration::from_secs(1),
                }),
                false,
            ),
        );
        // The new route's backend has the same address as the old one, but
        // it's a distinct Backend instance (as every reload/PUT constructs
        // fresh ones) -- the old one must still be retired.
        table.set("example.test", proxy_route(Backend::new("kept", 1), false));

        assert!(same_address.is_retired());
        assert!(dropped.is_retired());
    }
}
