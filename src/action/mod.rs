//! The action set: what a resolved route actually does with a connection.

mod static_assets;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::warn;

use crate::backend::Backend;
use crate::routing::{Algorithm, Route, RouteParams, RoutingTable};
use crate::splice;
use crate::state::stats::StatsRegistry;

/// Raised when a `proxy` route has no backend eligible to receive traffic.
#[derive(Debug, thiserror::Error)]
#[error("no healthy backends available for host {0:?}")]
pub struct NoHealthyBackends(pub String);

/// Alias chains longer than this, or ones that revisit a hostname, are
/// treated as an operator error and surfaced as `Unknown` rather than
/// recursing forever.
const MAX_ALIAS_DEPTH: usize = 8;

/// Per-connection context an [`Action`] needs to run: the request it parsed,
/// the route table (for `spin`/`alias` re-resolution), and static-file
/// overrides.
pub struct HandleContext {
    pub host: String,
    pub matched_host: String,
    pub protocol: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub routing: Arc<RoutingTable>,
    pub static_dir: Option<PathBuf>,
    pub stats: Arc<StatsRegistry>,
    /// Hostnames already traversed by `Alias::handle` for this connection,
    /// so a cycle (or an overly long chain) is caught instead of recursing
    /// without bound.
    pub alias_chain: Mutex<HashSet<String>>,
}

impl HandleContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Attributes bytes forwarded from the client to a backend (data that
    /// never gets written back to the client, so it wouldn't otherwise be
    /// reflected in an action's return value).
    fn record_bytes_to_backend(&self, n: u64) {
        if n > 0 {
            self.stats.add_bytes(&self.matched_host, 0, n);
        }
    }

    /// Records a step into `hostname`'s alias, returning `false` if doing so
    /// would revisit a hostname already in the chain or exceed the depth
    /// limit.
    fn enter_alias(&self, hostname: &str) -> bool {
        let mut chain = self.alias_chain.lock();
        if chain.len() >= MAX_ALIAS_DEPTH || chain.contains(hostname) {
            return false;
        }
        chain.insert(hostname.to_string());
        true
    }
}

/// Something that knows how to finish serving a connection once a route has
/// been resolved for it.
#[async_trait]
pub trait Action: Send + Sync {
    /// Serves the request over `socket`, using `read_data` (bytes already
    /// read off it while parsing the request line/headers), and returns the
    /// number of bytes written to the client. Bytes forwarded to a backend
    /// that never flow back to the client (the proxy request side) are
    /// instead recorded directly through `ctx.stats`.
    ///
    /// Takes the socket by reference so a caller can still write a fallback
    /// response if this returns an error.
    async fn handle(
        &self,
        socket: &mut TcpStream,
        read_data: &[u8],
        ctx: &HandleContext,
    ) -> anyhow::Result<u64>;
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        411 => "Length Required",
        420 => "Enhance Your Calm",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

async fn send_ignoring_broken_pipe(socket: &mut TcpStream, data: &[u8]) -> anyhow::Result<u64> {
    match socket.write_all(data).await {
        Ok(()) => Ok(data.len() as u64),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn status_only_response(code: u16) -> String {
    format!(
        "HTTP/1.0 {} {}\r\nConnection: close\r\nContent-length: 0\r\n\r\n",
        code,
        reason_phrase(code)
    )
}

/// Replies with a status-only 400, for a request line the parser couldn't
/// make sense of.
pub async fn send_bad_request(socket: &mut TcpStream) -> anyhow::Result<u64> {
    send_ignoring_broken_pipe(socket, status_only_response(400).as_bytes()).await
}

/// Replies with a status-only 411, for a request carrying `Transfer-Encoding`
/// (the splicer is opaque and cannot re-chunk).
pub async fn send_length_required(socket: &mut TcpStream) -> anyhow::Result<u64> {
    send_ignoring_broken_pipe(socket, status_only_response(411).as_bytes()).await
}

/// Best-effort reply when an action handler itself returns an error.
pub async fn send_internal_error(socket: &mut TcpStream) -> anyhow::Result<u64> {
    send_ignoring_broken_pipe(socket, status_only_response(500).as_bytes()).await
}

/// Replies with a status-only 420, when rate-limit enforcement is turned on
/// and a token is over its allowance.
pub async fn send_rate_limited(socket: &mut TcpStream) -> anyhow::Result<u64> {
    send_ignoring_broken_pipe(socket, status_only_response(420).as_bytes()).await
}

/// Sends back a status-only response.
pub struct Empty {
    pub code: u16,
}

#[async_trait]
impl Action for Empty {
    async fn handle(
        &self,
        socket: &mut TcpStream,
        _read_data: &[u8],
        _ctx: &HandleContext,
    ) -> anyhow::Result<u64> {
        let response = format!(
            "HTTP/1.0 {} {}\r\nConnection: close\r\nContent-length: 0\r\n\r\n",
            self.code,
            reason_phrase(self.code)
        );
        send_ignoring_broken_pipe(socket, response.as_bytes()).await
    }
}

/// Sends a canned static response, e.g. the built-in "unknown host" page.
pub struct Static {
    pub kind: String,
}

#[async_trait]
impl Action for Static {
    async fn handle(
        &self,
        socket: &mut TcpStream,
        _read_data: &[u8],
        ctx: &HandleContext,
    ) -> anyhow::Result<u64> {
        let body = static_assets::lookup(ctx.static_dir.as_deref(), &self.kind)?;
        send_ignoring_broken_pipe(socket, &body).await
    }
}

/// Sends a 302 redirect, preserving the request path.
pub struct Redirect {
    pub redirect_to: String,
}

#[async_trait]
impl Action for Redirect {
    async fn handle(
        &self,
        socket: &mut TcpStream,
        _read_data: &[u8],
        ctx: &HandleContext,
    ) -> anyhow::Result<u64> {
        let destination = if self.redirect_to.contains("://") {
            self.redirect_to.clone()
        } else {
            let forwarded_proto = ctx
                .header("X-Forwarded-Protocol")
                .or_else(|| ctx.header("X-Forwarded-Proto"))
                .unwrap_or("")
                .to_ascii_lowercase();
            let scheme = if forwarded_proto == "https" || forwarded_proto == "ssl" {
                "https"
            } else {
                "http"
            };
            format!("{scheme}://{}", self.redirect_to)
        };

        let location = format!(
            "{}/{}",
            destination.trim_end_matches('/'),
            ctx.path.trim_start_matches('/')
        );
        let response = format!("HTTP/1.0 302 Found\r\nLocation: {location}\r\n\r\n");
        send_ignoring_broken_pipe(socket, response.as_bytes()).await
    }
}

/// Holds the connection open, waiting for a non-`spin` route to show up.
pub struct Spin {
    pub timeout: u64,
    pub check_interval: u64,
}

#[async_trait]
impl Action for Spin {
    async fn handle(
        &self,
        socket: &mut TcpStream,
        read_data: &[u8],
        ctx: &HandleContext,
    ) -> anyhow::Result<u64> {
        let check_interval = self.check_interval.max(1);
        let iterations = self.timeout / check_interval;

        for _ in 0..iterations {
            tokio::time::sleep(Duration::from_secs(check_interval)).await;

            if let Some((_, route)) = ctx.routing.resolve(&ctx.host, &ctx.protocol) {
                if !matches!(route.params, RouteParams::Spin(_)) {
                    let action = build_action(&route);
                    return action.handle(socket, read_data, ctx).await;
                }
            }
        }

        let action = Static {
            kind: "timeout".to_string(),
        };
        action.handle(socket, read_data, ctx).await
    }
}

/// Delegates to whatever action is configured for another host entry.
pub struct Alias {
    pub hostname: String,
}

#[async_trait]
impl Action for Alias {
    async fn handle(
        &self,
        socket: &mut TcpStream,
        read_data: &[u8],
        ctx: &HandleContext,
    ) -> anyhow::Result<u64> {
        if !ctx.enter_alias(&self.hostname) {
            warn!(
                component = "action",
                event = "alias_cycle_detected",
                target = %self.hostname,
                "alias chain revisits a hostname or exceeds the depth limit"
            );
            return Static {
                kind: "unknown".to_string(),
            }
            .handle(socket, read_data, ctx)
            .await;
        }

        match ctx.routing.get(&self.hostname) {
            Some(route) => build_action(&route).handle(socket, read_data, ctx).await,
            None => {
                warn!(
                    component = "action",
                    event = "alias_target_missing",
                    target = %self.hostname,
                    "alias points at a host with no route"
                );
                Static {
                    kind: "unknown".to_string(),
                }
                .handle(socket, read_data, ctx)
                .await
            }
        }
    }
}

const PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Proxies the connection through to a selected backend.
pub struct Proxy {
    pub backends: Vec<Backend>,
    pub algorithm: Algorithm,
    pub healthcheck: bool,
    pub attempts: u32,
    pub delay: Duration,
}

impl Proxy {
    fn valid_backends(&self) -> Vec<&Backend> {
        self.backends
            .iter()
            .filter(|b| !self.healthcheck || !b.is_blacklisted())
            .collect()
    }

    fn select_backend(&self) -> Result<Backend, NoHealthyBackends> {
        let candidates = self.valid_backends();
        if candidates.is_empty() {
            return Err(NoHealthyBackends("<proxy>".to_string()));
        }

        let mut rng = rand::thread_rng();
        let chosen: &Backend = match self.algorithm {
            Algorithm::Random => *candidates.choose(&mut rng).expect("non-empty"),
            Algorithm::LeastConnections => {
                let min = candidates.iter().map(|b| b.connections()).min().expect("non-empty");
                let tied: Vec<&Backend> = candidates
                    .into_iter()
                    .filter(|b| b.connections() == min)
                    .collect();
                *tied.choose(&mut rng).expect("non-empty")
            }
        };
        Ok(chosen.clone())
    }

    fn blacklist(&self, backend: &Backend) {
        if self.healthcheck && !backend.is_blacklisted() {
            warn!(
                component = "action",
                event = "backend_blacklisted",
                backend = %backend.address_repr(),
                "blacklisting backend"
            );
            backend.blacklist();
        }
    }
}

#[async_trait]
impl Action for Proxy {
    async fn handle(
        &self,
        socket: &mut TcpStream,
        read_data: &[u8],
        ctx: &HandleContext,
    ) -> anyhow::Result<u64> {
        let mut connected: Option<(Backend, TcpStream)> = None;

        for attempt in 0..self.attempts.max(1) {
            if attempt > 0 {
                warn!(
                    component = "action",
                    event = "proxy_retry",
                    host = %ctx.host,
                    attempt,
                    "retrying connection"
                );
            }

            let backend = match self.select_backend() {
                Ok(b) => b,
                Err(_) => break,
            };

            match backend.connect(PROXY_CONNECT_TIMEOUT).await {
                Ok(server_sock) => {
                    backend.add_connection();
                    connected = Some((backend, server_sock));
                    break;
                }
                Err(e) => {
                    warn!(
                        component = "action",
                        event = "proxy_connect_failed",
                        host = %ctx.host,
                        backend = %backend.address_repr(),
                        error = %e,
                        "proxy socket error on connect"
                    );
                    self.blacklist(&backend);
                    tokio::time::sleep(self.delay).await;
                }
            }
        }

        // All attempts exhausted: no response is synthesized here, the
        // socket is simply closed by the caller's cleanup path.
        let Some((backend, server_sock)) = connected else {
            return Ok(0);
        };

        let mut server_sock = server_sock;
        let prefix_written = if read_data.is_empty() {
            0
        } else {
            match server_sock.write_all(read_data).await {
                Ok(()) => read_data.len() as u64,
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => 0,
                Err(e) => {
                    backend.drop_connection();
                    return Err(e.into());
                }
            }
        };

        let melded = splice::meld(socket, server_sock, &backend, &ctx.host).await;
        backend.drop_connection();

        // `prefix_written` forwards bytes that were already read from the
        // client during head parsing and counted by `StatsSocket`'s
        // `bytes_in` there; only the splicer's client->backend bytes (which
        // bypass `StatsSocket` entirely, since the action gets the raw
        // socket) are new here.
        ctx.record_bytes_to_backend(melded.to_server);
        Ok(melded.to_client)
    }
}

/// Builds the concrete [`Action`] for a resolved route.
pub fn build_action(route: &Route) -> Box<dyn Action> {
    match &route.params {
        RouteParams::Proxy(p) => Box::new(Proxy {
            backends: p.backends.clone(),
            algorithm: p.algorithm,
            healthcheck: p.healthcheck,
            attempts: p.attempts,
            delay: p.delay,
        }),
        RouteParams::Static(p) => Box::new(Static {
            kind: p.r#type.clone(),
        }),
        RouteParams::Empty(p) => Box::new(Empty { code: p.code }),
        RouteParams::Redirect(p) => Box::new(Redirect {
            redirect_to: p.redirect_to.clone(),
        }),
        RouteParams::Spin(p) => Box::new(Spin {
            timeout: p.timeout,
            check_interval: p.check_interval,
        }),
        RouteParams::Alias(p) => Box::new(Alias {
            hostname: p.hostname.clone(),
        }),
        RouteParams::Unknown => Box::new(Static {
            kind: "unknown".to_string(),
        }),
        RouteParams::NoHosts => Box::new(Static {
            kind: "no-hosts".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ProxyParams;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn context(routing: Arc<RoutingTable>) -> HandleContext {
        HandleContext {
            host: "example.test".to_string(),
            matched_host: "example.test".to_string(),
            protocol: "http".to_string(),
            path: "/".to_string(),
            headers: vec![],
            routing,
            static_dir: None,
            stats: Arc::new(StatsRegistry::new()),
            alias_chain: Mutex::new(HashSet::new()),
        }
    }

    #[tokio::test]
    async fn empty_action_writes_status_only_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let ctx = context(Arc::new(RoutingTable::new()));
            Empty { code: 204 }.handle(&mut sock, &[], &ctx).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        server.await.unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.0 204 No Content"));
    }

    #[tokio::test]
    async fn proxy_with_no_reachable_backends_closes_without_a_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dead_backend = Backend::new("127.0.0.1", 1);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let ctx = context(Arc::new(RoutingTable::new()));
            let proxy = Proxy {
                backends: vec![dead_backend],
                algorithm: Algorithm::LeastConnections,
                healthcheck: false,
                attempts: 1,
                delay: Duration::from_millis(1),
            };
            proxy.handle(&mut sock, &[], &ctx).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let written = server.await.unwrap();

        assert_eq!(written, 0);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn alias_delegates_to_target_route() {
        let routing = Arc::new(RoutingTable::new());
        routing.set(
            "target.test",
            Route::new(RouteParams::Empty(crate::routing::EmptyParams { code: 200 }), false),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routing_clone = routing.clone();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let ctx = context(routing_clone);
            Alias {
                hostname: "target.test".to_string(),
            }
            .handle(&mut sock, &[], &ctx)
            .await
            .unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        server.await.unwrap();

        assert!(String::from_utf8(buf).unwrap().starts_with("HTTP/1.0 200 OK"));
    }

    #[tokio::test]
    async fn alias_cycle_resolves_to_unknown_instead_of_recursing_forever() {
        let routing = Arc::new(RoutingTable::new());
        routing.set(
            "a.test",
            Route::new(
                RouteParams::Alias(crate::routing::AliasParams {
                    hostname: "b.test".to_string(),
                }),
                false,
            ),
        );
        routing.set(
            "b.test",
            Route::new(
                RouteParams::Alias(crate::routing::AliasParams {
                    hostname: "a.test".to_string(),
                }),
                false,
            ),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routing_clone = routing.clone();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let ctx = context(routing_clone);
            Alias {
                hostname: "a.test".to_string(),
            }
            .handle(&mut sock, &[], &ctx)
            .await
            .unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        server.await.unwrap();

        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.0 404"));
    }

    #[test]
    fn build_action_covers_every_route_kind() {
        let routes = [
            Route::new(RouteParams::Unknown, false),
            Route::new(RouteParams::NoHosts, false),
            Route::new(
                RouteParams::Proxy(ProxyParams {
                    backends: vec![Backend::new("a", 1)],
                    algorithm: Algorithm::Random,
                    healthcheck: true,
                    attempts: 2,
                    delay: Duration::from_secs(1),
                }),
                false,
            ),
        ];
        for route in routes {
            let _ = build_action(&route);
        }
    }
}
