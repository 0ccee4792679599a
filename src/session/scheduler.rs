//! Periodic driver for a session's tick.
//!
//! Polls the wall clock in [`MIN_TICK_INTERVAL`] slices and runs the tick
//! callback whenever at least `interval` has passed since the previous run.
//! The first tick fires right after spawning.

use crate::config::MIN_TICK_INTERVAL;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a running tick loop; cancelling or dropping it ends the loop
#[derive(Debug)]
pub struct Scheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
}

impl Scheduler {
    /// Spawn a tick loop on the current runtime.
    ///
    /// `tick` returns `false` to end the loop from inside. Intervals below
    /// [`MIN_TICK_INTERVAL`] are raised to it.
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let interval = interval.max(MIN_TICK_INTERVAL);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut last_run: Option<Instant> = None;
            loop {
                if last_run.map_or(true, |at| at.elapsed() >= interval) {
                    last_run = Some(Instant::now());
                    if !tick() {
                        break;
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(MIN_TICK_INTERVAL) => {}
                }
            }
            debug!(interval_ms = interval.as_millis() as u64, "Scheduler stopped");
        });

        Self {
            cancel,
            handle,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
