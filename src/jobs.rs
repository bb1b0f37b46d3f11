// Background schedules: dump refresh, city stats and price watch sweeps each
// run on their own task. A failed run is logged and the schedule carries on.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // A run that overshoots its slot does not trigger a burst of catch-up runs
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job = name, every_ms = interval.as_millis() as u64, "job scheduled");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = std::time::Instant::now();
                    match job().await {
                        Ok(()) => info!(job = name, elapsed_ms = started.elapsed().as_millis() as u64, "job run finished"),
                        Err(e) => warn!(job = name, error = %e, "job run failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(job = name, "job stopped");
                        return;
                    }
                }
            }
        }
    })
}
