use std::future::Future;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::{sleep, Sleep};
use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub completed: usize,
    pub peak_in_flight: usize,
}

/// Runs lookup jobs with at most `width` in flight. A slot freed by a finished job is
/// held for `pacing` before the next queued job may take it, which keeps the request
/// rate under roughly `width / (latency + pacing)` per second.
#[derive(Debug, Clone)]
pub struct RateLimitedDispatcher {
    width: usize,
    pacing: Duration,
}

impl RateLimitedDispatcher {
    pub fn new(width: usize, pacing: Duration) -> Self {
        Self {
            width: width.max(1),
            pacing,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    /// Admits jobs in submission order and calls `on_finished(index, output)` as each one
    /// completes, in completion order. Returns once every job has finished.
    ///
    /// Jobs are polled on the calling task, so they may borrow from the caller.
    pub async fn dispatch<I, Job, Fut, T, F>(&self, jobs: I, mut on_finished: F) -> DispatchReport
    where
        I: IntoIterator<Item = Job>,
        Job: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        F: FnMut(usize, T),
    {
        let mut queue = jobs.into_iter().enumerate().peekable();
        let mut running = FuturesUnordered::new();
        let mut cooling: FuturesUnordered<Sleep> = FuturesUnordered::new();
        let mut report = DispatchReport::default();

        loop {
            while running.len() + cooling.len() < self.width {
                let Some((index, job)) = queue.next() else {
                    break;
                };
                let pending = job();
                running.push(async move { (index, pending.await) });
                report.peak_in_flight = report.peak_in_flight.max(running.len());
                trace!(index, in_flight = running.len(), "job admitted");
            }

            if running.is_empty() {
                if queue.peek().is_none() {
                    break;
                }
                cooling.next().await;
                continue;
            }

            tokio::select! {
                Some((index, output)) = running.next() => {
                    report.completed += 1;
                    on_finished(index, output);
                    if !self.pacing.is_zero() && queue.peek().is_some() {
                        cooling.push(sleep(self.pacing));
                    }
                }
                Some(()) = cooling.next(), if !cooling.is_empty() => {}
            }
        }

        report
    }
}
