//! A single upstream endpoint and its self-healing health state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default delay between failed health probes.
pub const DEFAULT_HEALTHCHECK_DELAY: Duration = Duration::from_secs(1);
/// Default connect timeout used by the health prober.
pub const DEFAULT_HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// One upstream TCP address, plus its live connection/health state.
///
/// Cheap to clone: all mutable state lives behind atomics in the inner `Arc`.
#[derive(Clone)]
pub struct Backend(Arc<Inner>);

struct Inner {
    host: String,
    port: u16,
    active_connections: AtomicU64,
    blacklisted: AtomicBool,
    retired: AtomicBool,
    prober_running: AtomicBool,
    healthcheck_delay_millis: AtomicI64,
    healthcheck_timeout_millis: AtomicI64,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self(Arc::new(Inner {
            host: host.into(),
            port,
            active_connections: AtomicU64::new(0),
            blacklisted: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            prober_running: AtomicBool::new(false),
            healthcheck_delay_millis: AtomicI64::new(DEFAULT_HEALTHCHECK_DELAY.as_millis() as i64),
            healthcheck_timeout_millis: AtomicI64::new(
                DEFAULT_HEALTHCHECK_TIMEOUT.as_millis() as i64
            ),
        }))
    }

    pub fn host(&self) -> &str {
        &self.0.host
    }

    pub fn port(&self) -> u16 {
        self.0.port
    }

    pub fn address_repr(&self) -> String {
        format!("{}:{}", self.0.host, self.0.port)
    }

    pub fn connections(&self) -> u64 {
        self.0.active_connections.load(Ordering::Relaxed)
    }

    pub fn add_connection(&self) {
        self.0.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn drop_connection(&self) {
        self.0.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_blacklisted(&self) -> bool {
        self.0.blacklisted.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.0.retired.load(Ordering::Relaxed)
    }

    pub fn retire(&self) {
        self.0.retired.store(true, Ordering::Relaxed);
    }

    /// Marks this backend blacklisted, spawning a health prober if one isn't
    /// already running for it. A `false -> true -> false -> true` flutter
    /// never spawns a second concurrent prober.
    pub fn blacklist(&self) {
        let was_blacklisted = self.0.blacklisted.swap(true, Ordering::AcqRel);
        if !was_blacklisted {
            self.start_health_check();
        }
    }

    /// Marks this backend healthy again. Does not itself stop a prober: the
    /// prober observes this flag on its next iteration and exits.
    fn set_healthy(&self) {
        self.0.blacklisted.store(false, Ordering::Release);
    }

    /// Spawns the background health-check loop if one isn't already running.
    pub fn start_health_check(&self) {
        if self.0.prober_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let backend = self.clone();
        tokio::task::spawn(async move {
            backend.health_check_loop().await;
        });
    }

    async fn health_check_loop(&self) {
        loop {
            if self.is_retired() || !self.is_blacklisted() {
                let reason = if self.is_retired() {
                    "removing backend"
                } else {
                    "available"
                };
                info!(
                    component = "backend",
                    event = "health_check_stopped",
                    backend = %self.address_repr(),
                    reason,
                    "stopping health-checking"
                );
                self.0.prober_running.store(false, Ordering::Release);
                return;
            }

            self.check_health_once().await;

            let delay = Duration::from_millis(
                self.0.healthcheck_delay_millis.load(Ordering::Relaxed).max(0) as u64,
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn check_health_once(&self) {
        debug!(
            component = "backend",
            event = "health_check_attempt",
            backend = %self.address_repr(),
            "checking health"
        );
        let connect_timeout = Duration::from_millis(
            self.0
                .healthcheck_timeout_millis
                .load(Ordering::Relaxed)
                .max(0) as u64,
        );
        let addr = format!("{}:{}", self.0.host, self.0.port);
        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                debug!(
                    component = "backend",
                    event = "health_check_ok",
                    backend = %self.address_repr(),
                    "backend is alive, clearing blacklist"
                );
                self.set_healthy();
                drop(stream);
            }
            _ => {
                debug!(
                    component = "backend",
                    event = "health_check_failed",
                    backend = %self.address_repr(),
                    "backend still seems dead"
                );
            }
        }
    }

    pub async fn connect(&self, connect_timeout: Duration) -> std::io::Result<TcpStream> {
        let addr = format!("{}:{}", self.0.host, self.0.port);
        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timeout to {addr}"),
            )),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.0.host, self.0.port).parse().ok()
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Backend({}:{}, connections={}, blacklisted={}, retired={})",
            self.host(),
            self.port(),
            self.connections(),
            self.is_blacklisted(),
            self.is_retired()
        )
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.host() == other.host() && self.port() == other.port()
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid backend address {s:?}, expected host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid backend port in {s:?}"))?;
        Ok(Backend::new(host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn blacklist_starts_exactly_one_prober() {
        let backend = Backend::new("127.0.0.1", 1);
        backend.blacklist();
        backend.blacklist();
        backend.blacklist();
        // Only one prober_running flag is toggled regardless of repeated transitions.
        assert!(backend.is_blacklisted());
    }

    #[tokio::test]
    async fn probe_heals_backend_on_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let backend = Backend::new(addr.ip().to_string(), addr.port());
        backend.blacklist();
        assert!(backend.is_blacklisted());

        for _ in 0..50 {
            if !backend.is_blacklisted() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!backend.is_blacklisted());
    }

    #[test]
    fn connection_counter_never_negative_in_practice() {
        let backend = Backend::new("127.0.0.1", 1);
        backend.add_connection();
        backend.add_connection();
        assert_eq!(backend.connections(), 2);
        backend.drop_connection();
        assert_eq!(backend.connections(), 1);
    }

    #[test]
    fn parses_host_colon_port() {
        let backend: Backend = "example.test:8080".parse().unwrap();
        assert_eq!(backend.host(), "example.test");
        assert_eq!(backend.port(), 8080);
    }
}
