//! The per-connection request line/header parser and dispatcher.
//!
//! Reads just enough of the request to resolve a route and build the
//! rewritten prefix to forward, then hands the raw socket off to the
//! resolved [`Action`].

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::action::{self, HandleContext};
use crate::ratelimit::{token_from_headers, RateLimiter};
use crate::routing::RoutingTable;
use crate::state::stats::StatsRegistry;
use crate::stats_socket::StatsSocket;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Which side of the proxy accepted the connection. External listeners
/// rewrite `X-Forwarded-*`; internal listeners trust them as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    External,
    Internal,
}

/// Shared state every accepted connection needs.
pub struct ConnectionHandler {
    pub routing: Arc<RoutingTable>,
    pub stats: Arc<StatsRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub rps_headers: Vec<String>,
    pub static_dir: Option<std::path::PathBuf>,
    pub enforce_rate_limit: bool,
}

impl ConnectionHandler {
    /// Drives one accepted connection to completion. Never propagates an
    /// error to the listener loop: all failures are logged and the
    /// connection is simply closed.
    pub async fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: std::net::SocketAddr,
        listener_kind: ListenerKind,
    ) {
        let mut stats_socket = StatsSocket::new(socket);
        let mut buf = Vec::with_capacity(4096);

        let parsed = match read_request_head(&mut stats_socket, &mut buf).await {
            Ok(p) => p,
            Err(ParseError::Incomplete) | Err(ParseError::TooLarge) => {
                let mut sock = stats_socket.into_inner();
                let _ = action::send_bad_request(&mut sock).await;
                return;
            }
            Err(ParseError::Io(e)) => {
                debug!(component = "handler", event = "read_failed", error = %e, "failed to read request head");
                return;
            }
        };

        if parsed.has_transfer_encoding {
            let mut sock = stats_socket.into_inner();
            let _ = action::send_length_required(&mut sock).await;
            return;
        }

        let mut headers = parsed.headers;
        let path = parsed.path;
        let unread = parsed.trailing;

        let host = header_value(&headers, "LoadBalanceTo")
            .unwrap_or_else(|| "unknown".to_string());

        rewrite_headers(&mut headers, listener_kind, peer_addr);

        let protocol = if is_https(&headers) { "https" } else { "http" }.to_string();

        let token = token_from_headers(&self.rps_headers, |name| header_value(&headers, name));
        if self.rate_limiter.check(&token) {
            debug!(
                component = "handler",
                event = "rate_limited",
                token = %token,
                host = %host,
                enforced = self.enforce_rate_limit,
                "request over rate allowance"
            );
            if self.enforce_rate_limit {
                let mut sock = stats_socket.into_inner();
                let _ = action::send_rate_limited(&mut sock).await;
                return;
            }
        }

        let resolved = self.routing.resolve(&host, &protocol);
        let (matched_host, route) = match resolved {
            Some((key, route)) => (key, route),
            None if self.routing.is_empty() => (
                "__no_hosts__".to_string(),
                crate::routing::Route::new(crate::routing::RouteParams::NoHosts, false),
            ),
            None => (
                "__unknown__".to_string(),
                crate::routing::Route::new(crate::routing::RouteParams::Unknown, false),
            ),
        };

        let ctx = HandleContext {
            host: host.clone(),
            matched_host: matched_host.clone(),
            protocol,
            path,
            headers,
            routing: self.routing.clone(),
            static_dir: self.static_dir.clone(),
            stats: self.stats.clone(),
            alias_chain: parking_lot::Mutex::new(std::collections::HashSet::new()),
        };

        let prefix = rebuild_prefix(&parsed.request_line, &ctx.headers, &unread);
        let action = action::build_action(&route);

        self.stats.open_request(&matched_host);
        let counters = stats_socket.counters();
        let mut sock = stats_socket.into_inner();

        let result = action.handle(&mut sock, &prefix, &ctx).await;

        if let Err(e) = &result {
            warn!(
                component = "handler",
                event = "action_failed",
                host = %host,
                error = %e,
                "action handler returned an error"
            );
            let _ = action::send_internal_error(&mut sock).await;
        }

        self.stats.close_request(
            &matched_host,
            counters.bytes_out() + result.unwrap_or(0),
            counters.bytes_in(),
        );
    }
}

struct ParsedRequest {
    request_line: String,
    path: String,
    headers: Vec<(String, String)>,
    has_transfer_encoding: bool,
    trailing: Vec<u8>,
}

enum ParseError {
    Incomplete,
    TooLarge,
    Io(std::io::Error),
}

/// Reads off `sock` until a blank line terminates the headers, parsing the
/// request line and header set with `httparse`. Any bytes read past the
/// blank line (already-buffered body) are returned as `trailing`.
async fn read_request_head(
    sock: &mut StatsSocket,
    buf: &mut Vec<u8>,
) -> Result<ParsedRequest, ParseError> {
    let mut chunk = [0u8; 4096];
    loop {
        let mut headers_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers_storage);
        match req.parse(buf.as_slice()) {
            Ok(httparse::Status::Complete(consumed)) => {
                let method = req.method.ok_or(ParseError::Incomplete)?;
                let path = req.path.ok_or(ParseError::Incomplete)?.to_string();
                let version = req.version.ok_or(ParseError::Incomplete)?;
                let request_line = format!("{method} {path} HTTP/1.{version}");

                let mut headers = Vec::with_capacity(req.headers.len());
                let mut has_transfer_encoding = false;
                for h in req.headers.iter() {
                    let name = h.name.to_string();
                    let value = String::from_utf8_lossy(h.value).to_string();
                    if name.eq_ignore_ascii_case("Transfer-Encoding") {
                        has_transfer_encoding = true;
                    }
                    headers.push((name, value));
                }

                let trailing = buf[consumed..].to_vec();
                return Ok(ParsedRequest {
                    request_line,
                    path,
                    headers,
                    has_transfer_encoding,
                    trailing,
                });
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_HEADER_BYTES {
                    return Err(ParseError::TooLarge);
                }
                let n = sock.read(&mut chunk).await.map_err(ParseError::Io)?;
                if n == 0 {
                    return Err(ParseError::Incomplete);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(_) => return Err(ParseError::Incomplete),
        }
    }
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: impl Into<String>) {
    if let Some(entry) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = value.into();
    } else {
        headers.push((name.to_string(), value.into()));
    }
}

fn rewrite_headers(
    headers: &mut Vec<(String, String)>,
    listener_kind: ListenerKind,
    peer_addr: std::net::SocketAddr,
) {
    set_header(headers, "Connection", "close");

    if listener_kind == ListenerKind::External {
        set_header(headers, "X-Forwarded-For", peer_addr.ip().to_string());
        set_header(headers, "X-Forwarded-Protocol", "");
        set_header(headers, "X-Forwarded-Proto", "");
    }
}

fn is_https(headers: &[(String, String)]) -> bool {
    let proto = header_value(headers, "X-Forwarded-Protocol")
        .or_else(|| header_value(headers, "X-Forwarded-Proto"))
        .unwrap_or_default()
        .to_ascii_lowercase();
    proto == "https" || proto == "ssl"
}

fn rebuild_prefix(request_line: &str, headers: &[(String, String)], trailing: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(request_line.len() + 2 + trailing.len() + 256);
    out.extend_from_slice(request_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(trailing);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiter;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn handler() -> ConnectionHandler {
        ConnectionHandler {
            routing: Arc::new(RoutingTable::new()),
            stats: Arc::new(StatsRegistry::new()),
            rate_limiter: Arc::new(RateLimiter::new(100.0)),
            rps_headers: vec!["X-Rate-Header".to_string()],
            static_dir: None,
            enforce_rate_limit: false,
        }
    }

    #[tokio::test]
    async fn unresolvable_host_gets_the_unknown_static_page() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let h = handler();
        h.routing.set(
            "somehost.test",
            crate::routing::Route::new(
                crate::routing::RouteParams::Empty(crate::routing::EmptyParams { code: 200 }),
                false,
            ),
        );

        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            h.handle_connection(sock, peer, ListenerKind::External).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: nowhere.test\r\nLoadBalanceTo: nowhere.test\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt as _;
        client.read_to_end(&mut buf).await.unwrap();
        server.await.unwrap();

        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.0 404"));
    }

    #[tokio::test]
    async fn malformed_request_line_gets_400() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let h = handler();

        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            h.handle_connection(sock, peer, ListenerKind::External).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"not a request\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt as _;
        client.read_to_end(&mut buf).await.unwrap();
        server.await.unwrap();

        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.0 400"));
    }

    #[tokio::test]
    async fn enforced_rate_limit_gets_420() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut h = handler();
        h.enforce_rate_limit = true;
        h.rate_limiter = Arc::new(RateLimiter::new(0.0));

        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            h.handle_connection(sock, peer, ListenerKind::External).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nX-Rate-Header: abuser\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt as _;
        client.read_to_end(&mut buf).await.unwrap();
        server.await.unwrap();

        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.0 420"));
    }

    #[tokio::test]
    async fn transfer_encoding_gets_411() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let h = handler();

        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            h.handle_connection(sock, peer, ListenerKind::External).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt as _;
        client.read_to_end(&mut buf).await.unwrap();
        server.await.unwrap();

        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.0 411"));
    }
}
