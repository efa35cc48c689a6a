//! Cached wall-clock time, to avoid a syscall on every rate-limit check.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

static NOW_UNIX_NANOS: AtomicI64 = AtomicI64::new(0);

fn read_system_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as i64
}

/// Starts the background ticker that refreshes the cached clock at `resolution`.
/// Returns a token the caller can cancel to stop the ticker.
pub fn start(resolution: Duration) -> CancellationToken {
    NOW_UNIX_NANOS.store(read_system_clock(), Ordering::Relaxed);

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(resolution);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    NOW_UNIX_NANOS.store(read_system_clock(), Ordering::Relaxed);
                }
                _ = token_clone.cancelled() => {
                    break;
                }
            }
        }
    });

    token
}

/// Returns the cached current time.
pub fn now() -> SystemTime {
    let nanos = NOW_UNIX_NANOS.load(Ordering::Relaxed);
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

/// Returns the duration elapsed since `t`, saturating at zero.
pub fn since(t: SystemTime) -> Duration {
    now().duration_since(t).unwrap_or(Duration::ZERO)
}
