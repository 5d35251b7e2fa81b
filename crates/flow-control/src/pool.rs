//! Bounded-concurrency batch execution.
//!
//! Every item gets its own future; a [`Semaphore`] bounds how many run at
//! once. Results are always positional: `results[i]` belongs to `items[i]`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::semaphore::Semaphore;

/// Runs `processor` over `items` with at most `max_concurrency` in flight.
///
/// Fails fast: the first error is returned and outstanding items are dropped.
pub async fn process_with_concurrency<T, R, E, F, Fut>(
    items: Vec<T>,
    processor: F,
    max_concurrency: usize,
) -> Result<Vec<R>, E>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let semaphore = Semaphore::new(max_concurrency.max(1));
    let semaphore = &semaphore;
    let processor = &processor;

    try_join_all(items.into_iter().enumerate().map(|(index, item)| async move {
        let _permit = semaphore.acquire().await;
        processor(item, index).await
    }))
    .await
}

/// Like [`process_with_concurrency`], but a failing item never aborts the batch.
pub async fn process_settled<T, R, E, F, Fut>(
    items: Vec<T>,
    processor: F,
    max_concurrency: usize,
) -> Vec<Result<R, E>>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let semaphore = Semaphore::new(max_concurrency.max(1));
    let semaphore = &semaphore;
    let processor = &processor;

    join_all(items.into_iter().enumerate().map(|(index, item)| async move {
        let _permit = semaphore.acquire().await;
        processor(item, index).await
    }))
    .await
}

/// Snapshot of a running batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub total: usize,
    /// Items finished, successfully or not.
    pub completed: usize,
    pub failed: usize,
    /// Items currently holding a permit.
    pub active: usize,
    pub elapsed: Duration,
    /// `avg_time_per_completed_item * remaining_items`; `None` until one item finishes.
    pub estimated_remaining: Option<Duration>,
}

impl Progress {
    fn compute(total: usize, completed: usize, failed: usize, active: usize, elapsed: Duration) -> Self {
        let estimated_remaining = (completed > 0).then(|| {
            let remaining = total.saturating_sub(completed) as u32;
            (elapsed / completed as u32) * remaining
        });
        Self {
            total,
            completed,
            failed,
            active,
            elapsed,
            estimated_remaining,
        }
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

/// Outcome of [`ConcurrencyPool::process`].
#[derive(Debug)]
pub struct BatchReport<R, E> {
    pub results: Vec<Result<R, E>>,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl<R, E> BatchReport<R, E> {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn errors(&self) -> impl Iterator<Item = (usize, &E)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
    }
}

/// A named pool that publishes progress while processing a batch.
///
/// Progress is published on a `watch` channel; subscribe before calling
/// [`ConcurrencyPool::process`] to observe intermediate snapshots.
pub struct ConcurrencyPool {
    name: String,
    max_concurrency: usize,
    progress_tx: watch::Sender<Progress>,
}

impl ConcurrencyPool {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        let (progress_tx, _) = watch::channel(Progress::default());
        Self {
            name: name.into(),
            max_concurrency: max_concurrency.max(1),
            progress_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    /// Latest published snapshot.
    pub fn progress(&self) -> Progress {
        self.progress_tx.borrow().clone()
    }

    /// Process `items` with settled semantics, reporting progress after each item.
    pub async fn process<T, R, E, F, Fut>(&self, items: Vec<T>, processor: F) -> BatchReport<R, E>
    where
        F: Fn(T, usize) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let total = items.len();
        let started = Instant::now();
        let completed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let active = AtomicUsize::new(0);
        let semaphore = Semaphore::new(self.max_concurrency);

        let publish = || {
            let snapshot = Progress::compute(
                total,
                completed.load(Ordering::SeqCst),
                failed.load(Ordering::SeqCst),
                active.load(Ordering::SeqCst),
                started.elapsed(),
            );
            self.progress_tx.send_replace(snapshot);
        };

        publish();

        let (semaphore, processor, publish) = (&semaphore, &processor, &publish);
        let (completed_ref, failed_ref, active_ref) = (&completed, &failed, &active);

        let results = join_all(items.into_iter().enumerate().map(|(index, item)| async move {
            let _permit = semaphore.acquire().await;
            active_ref.fetch_add(1, Ordering::SeqCst);
            publish();

            let result = processor(item, index).await;

            active_ref.fetch_sub(1, Ordering::SeqCst);
            if result.is_err() {
                failed_ref.fetch_add(1, Ordering::SeqCst);
            }
            completed_ref.fetch_add(1, Ordering::SeqCst);
            publish();
            result
        }))
        .await;

        let failed = failed.load(Ordering::SeqCst);
        let elapsed = started.elapsed();
        debug!(
            pool = %self.name,
            total,
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch finished"
        );

        BatchReport {
            succeeded: total - failed,
            failed,
            results,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_estimate() {
        let p = Progress::compute(10, 4, 1, 2, Duration::from_secs(8));
        // 2s per completed item, 6 remaining.
        assert_eq!(p.estimated_remaining, Some(Duration::from_secs(12)));
        assert_eq!(p.remaining(), 6);
        assert!((p.percent() - 40.0).abs() < f64::EPSILON);
        assert!(!p.is_done());
    }

    #[test]
    fn test_progress_without_completions_has_no_estimate() {
        let p = Progress::compute(3, 0, 0, 1, Duration::from_secs(1));
        assert!(p.estimated_remaining.is_none());
    }

    #[tokio::test]
    async fn test_results_are_positional() {
        let items = vec![30u64, 10, 20];
        let results = process_with_concurrency(
            items,
            |delay, index| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, String>(index * 10)
            },
            3,
        )
        .await
        .unwrap();
        assert_eq!(results, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_fail_fast_returns_first_error() {
        let result = process_with_concurrency(
            vec![1, 2, 3],
            |n, _| async move {
                if n == 2 { Err(format!("item {n} failed")) } else { Ok(n) }
            },
            2,
        )
        .await;
        assert_eq!(result.unwrap_err(), "item 2 failed");
    }

    #[tokio::test]
    async fn test_settled_records_errors_in_place() {
        let results = process_settled(
            vec![1, 2, 3, 4],
            |n, _| async move { if n % 2 == 0 { Err(n) } else { Ok(n) } },
            2,
        )
        .await;
        assert_eq!(results, vec![Ok(1), Err(2), Ok(3), Err(4)]);
    }

    #[tokio::test]
    async fn test_pool_reports_final_progress() {
        let pool = ConcurrencyPool::new("test", 2);
        let report = pool
            .process(vec![1, 2, 3, 4, 5], |n, _| async move {
                if n == 3 { Err("boom") } else { Ok(n) }
            })
            .await;

        assert_eq!(report.total(), 5);
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors().map(|(i, _)| i).collect::<Vec<_>>(), vec![2]);

        let progress = pool.progress();
        assert_eq!(progress.completed, 5);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.active, 0);
        assert!(progress.is_done());
        assert_eq!(progress.estimated_remaining, Some(Duration::ZERO));
    }
}
