//! Bidirectional byte pump between a client and a chosen backend connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::Backend;

const CHUNK_SIZE: usize = 32 * 1024;
const TRANSMISSION_TIMEOUT: Duration = Duration::from_secs(30);

/// The synthesized response sent to the client when the backend never wrote
/// a single byte before the transmission timeout elapsed.
pub const BACKEND_TIMEOUT_RESPONSE: &[u8] =
    b"HTTP/1.0 594 Backend timeout\r\nConnection: close\r\nContent-length: 0\r\n\r\n";

/// Byte counts for each direction of a completed [`meld`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MeldStats {
    /// Bytes forwarded client -> backend.
    pub to_server: u64,
    /// Bytes forwarded backend -> client.
    pub to_client: u64,
}

impl MeldStats {
    pub fn total(&self) -> u64 {
        self.to_server + self.to_client
    }
}

/// Splices `client` and `server` together until either side closes, an I/O
/// error occurs, or the per-direction transmission timeout elapses.
///
/// `client` is borrowed (the connection handler keeps ownership so it can
/// still use the socket if this returns early); `server` is consumed since
/// it was just opened for this one proxied request.
pub async fn meld(
    client: &mut TcpStream,
    server: TcpStream,
    backend: &Backend,
    host: &str,
) -> MeldStats {
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = server.into_split();

    let to_server = Arc::new(AtomicU64::new(0));
    let to_client = Arc::new(AtomicU64::new(0));

    // Shared between both directions: if one side fails to shut its write
    // half down cleanly, the other is told to stop rather than being left to
    // idle on a half that will never see EOF or another write error.
    let cancel = CancellationToken::new();

    let ctos = pipe_direction(
        client_read,
        server_write,
        Direction::ClientToServer,
        to_server.clone(),
        backend.clone(),
        host.to_string(),
        cancel.clone(),
    );
    let stoc = pipe_direction(
        server_read,
        client_write,
        Direction::ServerToClient,
        to_client.clone(),
        backend.clone(),
        host.to_string(),
        cancel.clone(),
    );

    tokio::join!(ctos, stoc);

    MeldStats {
        to_server: to_server.load(Ordering::Acquire),
        to_client: to_client.load(Ordering::Acquire),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

async fn pipe_direction<R, W>(
    mut read_half: R,
    mut write_half: W,
    direction: Direction,
    handled: Arc<AtomicU64>,
    backend: Backend,
    host: String,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let local_handled = AtomicU64::new(0);

    let copy = async {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        if write_half.shutdown().await.is_err() {
                            cancel.cancel();
                        }
                        return;
                    }
                    Ok(n) => n,
                    Err(_) => {
                        cancel.cancel();
                        return;
                    }
                },
            };
            if write_half.write_all(&buf[..n]).await.is_err() {
                // Matches the original's "best effort, ignore send errors" behavior.
                cancel.cancel();
            }
            local_handled.fetch_add(n as u64, Ordering::Relaxed);
            handled.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    if tokio::time::timeout(TRANSMISSION_TIMEOUT, copy).await.is_err() {
        warn!(
            component = "splice",
            event = "transmission_timeout",
            backend = %backend.address_repr(),
            host = %host,
            "timeout serving request to backend"
        );
        if direction == Direction::ServerToClient && local_handled.load(Ordering::Relaxed) == 0 {
            let _ = write_half.write_all(BACKEND_TIMEOUT_RESPONSE).await;
        }
    }
}
