use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs `tick` immediately and then every `interval` until `shutdown` is
/// cancelled. A tick in progress is allowed to finish; cancellation is only
/// observed between ticks.
pub(crate) async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(task = name, interval_ms = interval.as_millis() as u64, "Periodic task started");

    while !shutdown.is_cancelled() {
        tick().await;
        debug!(task = name, "Periodic pass finished");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(task = name, "Periodic task stopped");
}
