//! Cancel-aware periodic scheduling.
//!
//! One abstraction serves the main poll loop, claim/subtask heartbeats,
//! and the coordinator's wait loop, so every periodic task shuts down the
//! same way.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Run `f` every `interval` until it returns `ControlFlow::Break` or
/// `cancel` fires. The first invocation happens after one full interval.
pub async fn every<F, Fut>(interval: Duration, cancel: &CancellationToken, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<()>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval() fires immediately on the first tick; swallow it so the
    // first run lands after one full period.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if f().await.is_break() {
                    return;
                }
            }
        }
    }
}

/// Sleep that wakes early on cancellation. Returns `true` when the full
/// duration elapsed, `false` when cancelled.
pub async fn sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
