//! Bounded-concurrency work pool with global dispatch pacing
//!
//! `run` moves through Idle -> Running -> Drained. While running it alternates
//! between filling free slots from the queue and waiting for the next
//! completion. Every dispatch, from any slot, first waits until
//! `min_spacing` has passed since the previous dispatch: the spacing models
//! one shared upstream rate limit, not one per slot.
//!
//! All in-flight items are driven from the calling task, so the queue and
//! in-flight set have a single owner and in-flight items keep progressing
//! while the loop waits on the pacing clock.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Spacing used when callers have no better number.
pub const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(1000);

/// Counts for one `run` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub completed: usize,
    /// Items whose processing function returned `Err` or panicked
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed,
    Failed,
}

impl RunSummary {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }
}

/// Work pool with a hard in-flight ceiling and a global dispatch spacing.
#[derive(Debug, Clone)]
pub struct RateLimitedWorkPool {
    concurrency: usize,
    min_spacing: Duration,
}

impl RateLimitedWorkPool {
    /// A concurrency of zero is raised to one.
    pub fn new(concurrency: usize, min_spacing: Duration) -> Self {
        let concurrency = if concurrency == 0 {
            warn!("work pool concurrency of 0 requested, using 1");
            1
        } else {
            concurrency
        };
        Self {
            concurrency,
            min_spacing,
        }
    }

    /// Pool with `DEFAULT_MIN_SPACING`.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self::new(concurrency, DEFAULT_MIN_SPACING)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Process every item exactly once and return when all have finished.
    ///
    /// Items are dispatched in iteration order. `process` should record its
    /// own results; an `Err` or panic from one item is logged and counted
    /// but never stops the batch.
    pub async fn run<T, F, Fut, E>(&self, items: impl IntoIterator<Item = T>, process: F) -> RunSummary
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut queue: VecDeque<T> = items.into_iter().collect();
        let mut in_flight = FuturesUnordered::new();
        let mut last_dispatch: Option<Instant> = None;
        let mut summary = RunSummary::default();
        let started = Instant::now();

        info!(
            items = queue.len(),
            concurrency = self.concurrency,
            min_spacing_ms = self.min_spacing.as_millis() as u64,
            "work pool running"
        );

        loop {
            while in_flight.len() < self.concurrency {
                let Some(item) = queue.pop_front() else {
                    break;
                };

                if let Some(last) = last_dispatch {
                    let ready_at = last + self.min_spacing;
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep_until(ready_at) => break,
                            Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                                summary.record(outcome);
                            }
                        }
                    }
                }

                last_dispatch = Some(Instant::now());
                let index = summary.dispatched;
                summary.dispatched += 1;
                debug!(item = index, in_flight = in_flight.len() + 1, "dispatching work item");
                in_flight.push(drive_item(index, process(item)));
            }

            match in_flight.next().await {
                Some(outcome) => summary.record(outcome),
                None => break,
            }
        }

        info!(
            dispatched = summary.dispatched,
            completed = summary.completed,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "work pool drained"
        );
        summary
    }
}

/// Await one item, isolating its error or panic from the rest of the batch.
async fn drive_item<Fut, E>(index: usize, work: Fut) -> ItemOutcome
where
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let started = Instant::now();
    crate::metrics::item_started();

    let outcome = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => ItemOutcome::Completed,
        Ok(Err(e)) => {
            warn!(item = index, error = %e, "work item failed");
            ItemOutcome::Failed
        }
        Err(_) => {
            error!(item = index, "work item panicked");
            ItemOutcome::Failed
        }
    };

    let label = match outcome {
        ItemOutcome::Completed => "completed",
        ItemOutcome::Failed => "failed",
    };
    crate::metrics::item_finished(label, started.elapsed().as_secs_f64());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn processes_each_item_once_with_global_spacing() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pool = RateLimitedWorkPool::new(2, Duration::from_millis(100));

        let start = Instant::now();
        let summary = pool
            .run(vec![1, 2, 3, 4, 5], |i: i32| {
                calls.lock().unwrap().push(i);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<(), Infallible>(())
                }
            })
            .await;

        assert_eq!(*calls.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            summary,
            RunSummary {
                dispatched: 5,
                completed: 5,
                failed: 0
            }
        );
        assert!(
            start.elapsed() >= Duration::from_millis(400),
            "four gaps of 100ms, got {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_dispatches_respect_min_spacing() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let pool = RateLimitedWorkPool::new(4, Duration::from_millis(250));

        pool.run(0..8, |_| {
            stamps.lock().unwrap().push(Instant::now());
            async {
                tokio::time::sleep(Duration::from_millis(700)).await;
                Ok::<(), Infallible>(())
            }
        })
        .await;

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 8);
        for pair in stamps.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(250),
                "gap {:?} below spacing",
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = RateLimitedWorkPool::new(3, Duration::from_millis(5));

        let summary = pool
            .run(0..20, |i: u64| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50 + (i % 4) * 30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), Infallible>(())
                }
            })
            .await;

        assert_eq!(summary.completed, 20);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_items_progress_during_pacing_wait() {
        let finished_at = Arc::new(Mutex::new(Vec::new()));
        let pool = RateLimitedWorkPool::new(2, Duration::from_millis(1000));
        let start = Instant::now();

        pool.run(0..2, |i: usize| {
            let finished_at = finished_at.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished_at.lock().unwrap().push((i, start.elapsed()));
                Ok::<(), Infallible>(())
            }
        })
        .await;

        let finished_at = finished_at.lock().unwrap();
        let first = finished_at.iter().find(|(i, _)| *i == 0).unwrap().1;
        assert_eq!(first, Duration::from_millis(10), "item 0 must not stall behind the pacing wait");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_do_not_abort_batch() {
        let pool = RateLimitedWorkPool::new(2, Duration::ZERO);

        let summary = pool
            .run(0..6, |i: usize| async move {
                match i {
                    1 => Err(format!("item {i} failed")),
                    4 => panic!("item {i} blew up"),
                    _ => Ok(()),
                }
            })
            .await;

        assert_eq!(
            summary,
            RunSummary {
                dispatched: 6,
                completed: 4,
                failed: 2
            }
        );
    }

    #[test]
    fn release_profile_keeps_unwinding_for_panic_isolation() {
        // catch_unwind in drive_item is a no-op when panics abort.
        let manifest = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../Cargo.toml"));
        let aborts = manifest
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with('#'))
            .any(|l| l.starts_with("panic") && l.contains("abort"));
        assert!(!aborts, "workspace profiles must not set panic = abort");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_drains_immediately() {
        let pool = RateLimitedWorkPool::with_concurrency(4);
        let start = Instant::now();
        let summary = pool
            .run(Vec::<u8>::new(), |_| async { Ok::<(), Infallible>(()) })
            .await;
        assert_eq!(summary, RunSummary::default());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn first_dispatch_is_not_delayed() {
        let pool = RateLimitedWorkPool::new(1, Duration::from_secs(10));
        let start = Instant::now();
        pool.run([()], |_| async { Ok::<(), Infallible>(()) }).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let pool = RateLimitedWorkPool::new(0, Duration::ZERO);
        assert_eq!(pool.concurrency(), 1);
        assert_eq!(
            RateLimitedWorkPool::with_concurrency(2).min_spacing(),
            DEFAULT_MIN_SPACING
        );
    }
}
