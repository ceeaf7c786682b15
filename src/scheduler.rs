//! A single scheduler interface (§9) used by every background sweeper:
//! rate-limit cleanup, token cleanup, the dispatcher's retry sweep, and the
//! webhook engine's rate-limit cleanup. Built on `tokio::time::interval` with
//! `MissedTickBehavior::Skip` and a shutdown-select loop.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Run `task` every `period` until `shutdown` fires. A tick that is missed
/// (e.g. because `task` itself ran long) is skipped rather than queued.
pub async fn schedule<F, Fut>(period: Duration, mut shutdown: mpsc::Receiver<()>, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                task().await;
            }
            _ = shutdown.recv() => {
                tracing::info!("scheduler shutting down");
                return;
            }
        }
    }
}
