//! Lifecycle owner: loads persisted state, opens listeners, spawns the
//! periodic save/maintenance/monitoring loops, drops privileges, and serves
//! until a shutdown signal arrives.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::StartupConfig;
use crate::handler::{ConnectionHandler, ListenerKind};
use crate::management;
use crate::ratelimit::RateLimiter;
use crate::routing::RoutingTable;
use crate::shutdown::GracefulShutdown;
use crate::state::{self, stats::StatsRegistry};

pub struct Balancer {
    cfg: StartupConfig,
    routing: Arc<RoutingTable>,
    stats: Arc<StatsRegistry>,
    rate_limiter: Arc<RateLimiter>,
    shutdown_token: CancellationToken,
}

impl Balancer {
    /// Loads the persisted snapshot (or starts empty) and builds the
    /// balancer, ready to `serve`.
    pub fn new(cfg: StartupConfig, shutdown_token: CancellationToken) -> anyhow::Result<Self> {
        let (routing, stats) = state::load(&cfg.state_file)?;
        let rate_limiter = Arc::new(RateLimiter::new(cfg.max_rps));

        Ok(Self {
            cfg,
            routing: Arc::new(routing),
            stats: Arc::new(stats),
            rate_limiter,
            shutdown_token,
        })
    }

    /// Opens all configured listeners and runs until shutdown, registering
    /// each spawned task with `graceful` so shutdown waits for them to drain.
    pub async fn serve(&self, graceful: &GracefulShutdown) -> anyhow::Result<()> {
        let mut external_listeners = Vec::new();
        for addr in &self.cfg.external_listeners {
            match self.bind_listener(*addr).await {
                Ok(Some(listener)) => external_listeners.push(listener),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }

        let mut internal_listeners = Vec::new();
        for addr in &self.cfg.internal_listeners {
            match self.bind_listener(*addr).await {
                Ok(Some(listener)) => internal_listeners.push(listener),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }

        self.drop_privileges();

        for listener in external_listeners {
            self.spawn_accept_loop(listener, ListenerKind::External, graceful);
        }
        for listener in internal_listeners {
            self.spawn_accept_loop(listener, ListenerKind::Internal, graceful);
        }

        graceful.add(1);
        let management_routing = self.routing.clone();
        let management_stats = self.stats.clone();
        let management_addrs = self.cfg.management_listeners.clone();
        let management_shutdown = self.shutdown_token.clone();
        let management_graceful = graceful.clone();
        tokio::task::spawn(async move {
            if let Err(e) = management::serve(
                management_addrs,
                management_routing,
                management_stats,
                management_shutdown,
            )
            .await
            {
                error!(
                    component = "balancer",
                    event = "management_failed",
                    error = %e,
                    "management API exited with an error"
                );
            }
            management_graceful.done();
        });

        graceful.add(1);
        let save_path = self.cfg.state_file.clone();
        let save_routing = self.routing.clone();
        let save_stats = self.stats.clone();
        let save_interval = self.cfg.save_interval;
        let save_shutdown = self.shutdown_token.clone();
        let save_graceful = graceful.clone();
        tokio::task::spawn(async move {
            state::save_loop(save_path, save_routing, save_stats, save_interval, save_shutdown).await;
            save_graceful.done();
        });

        graceful.add(1);
        let maintenance_rate_limiter = self.rate_limiter.clone();
        let maintenance_interval = self.cfg.maintenance_interval;
        let maintenance_shutdown = self.shutdown_token.clone();
        let maintenance_graceful = graceful.clone();
        tokio::task::spawn(async move {
            Self::maintenance_loop(maintenance_rate_limiter, maintenance_interval, maintenance_shutdown).await;
            maintenance_graceful.done();
        });

        graceful.add(1);
        let monitoring_rate_limiter = self.rate_limiter.clone();
        let monitoring_interval = self.cfg.monitoring_interval;
        let monitoring_shutdown = self.shutdown_token.clone();
        let monitoring_graceful = graceful.clone();
        tokio::task::spawn(async move {
            Self::monitoring_loop(monitoring_rate_limiter, monitoring_interval, monitoring_shutdown).await;
            monitoring_graceful.done();
        });

        Ok(())
    }

    /// Binds `addr`. `EADDRINUSE` is fatal; `EACCES` on a privileged port is
    /// logged and the listener is skipped.
    async fn bind_listener(&self, addr: std::net::SocketAddr) -> anyhow::Result<Option<TcpListener>> {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(component = "balancer", event = "listening", addr = %addr, "listener bound");
                Ok(Some(listener))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                error!(component = "balancer", event = "bind_failed", addr = %addr, error = %e, "address already in use");
                Err(e.into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && addr.port() <= 1024 => {
                warn!(
                    component = "balancer",
                    event = "bind_skipped",
                    addr = %addr,
                    error = %e,
                    "insufficient privilege to bind this port, skipping listener"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn spawn_accept_loop(&self, listener: TcpListener, kind: ListenerKind, graceful: &GracefulShutdown) {
        let handler = Arc::new(ConnectionHandler {
            routing: self.routing.clone(),
            stats: self.stats.clone(),
            rate_limiter: self.rate_limiter.clone(),
            rps_headers: self.cfg.rps_headers.clone(),
            static_dir: self.cfg.static_dir.clone(),
            enforce_rate_limit: self.cfg.enforce_rate_limit,
        });
        let shutdown = self.shutdown_token.clone();

        graceful.add(1);
        let graceful = graceful.clone();
        tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, peer_addr)) => {
                                let handler = handler.clone();
                                tokio::task::spawn(async move {
                                    handler.handle_connection(socket, peer_addr, kind).await;
                                });
                            }
                            Err(e) => {
                                warn!(component = "balancer", event = "accept_failed", error = %e, "failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            graceful.done();
        });
    }

    /// Drops to the configured uid/gid after privileged ports are bound.
    /// setgid runs before setuid: once the uid changes, the process may no
    /// longer be permitted to change its gid.
    fn drop_privileges(&self) {
        #[cfg(unix)]
        {
            if let Some(gid) = self.cfg.gid {
                if unsafe { libc::setgid(gid) } != 0 {
                    warn!(component = "balancer", event = "setgid_failed", gid, "failed to drop group privileges");
                } else {
                    info!(component = "balancer", event = "setgid_ok", gid, "dropped group privileges");
                }
            }
            if let Some(uid) = self.cfg.uid {
                if unsafe { libc::setuid(uid) } != 0 {
                    warn!(component = "balancer", event = "setuid_failed", uid, "failed to drop user privileges");
                } else {
                    info!(component = "balancer", event = "setuid_ok", uid, "dropped user privileges");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if self.cfg.uid.is_some() || self.cfg.gid.is_some() {
                warn!(component = "balancer", event = "setuid_unsupported", "privilege drop requested on a non-unix target, ignoring");
            }
        }
    }

    async fn maintenance_loop(rate_limiter: Arc<RateLimiter>, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    rate_limiter.garbage_collect(interval);
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn monitoring_loop(rate_limiter: Arc<RateLimiter>, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!(
                        component = "balancer",
                        event = "rate_limit_snapshot",
                        limited_total = rate_limiter.limited_total(),
                        tracked_tokens = rate_limiter.tracked_tokens(),
                        "rate limiter snapshot"
                    );
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }
}
