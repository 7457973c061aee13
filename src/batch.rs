//! Bounded-concurrency fan-out/fan-in (spec §4.J).
//!
//! Generalizes `fusillade::daemon::Daemon`'s per-model `Semaphore` +
//! `JoinSet` fan-in (one semaphore per model, bounding how many requests for
//! that model run at once) to "one semaphore for the whole batch call,"
//! since here every item in a batch competes for the same concurrency
//! budget rather than being partitioned by key.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::CallContext;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions { concurrency: 10 }
    }
}

/// One request's outcome, tagged with the index it came from so callers can
/// line results back up with their inputs regardless of completion order
/// (spec §8 property 7).
#[derive(Debug)]
pub struct BatchResult<T> {
    pub input_index: usize,
    pub value: Option<T>,
    pub err: Option<Error>,
}

impl<T> BatchResult<T> {
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

/// Runs `per_item` over every element of `requests` with at most
/// `options.concurrency` executions in flight, returning results in the
/// same order and length as the input (spec §4.J, §8 property 7).
/// Cancelling `ctx` cancels every outstanding in-flight item; the call
/// still returns only once every launched task has settled, never leaving
/// a dangling background task behind.
pub async fn execute_batch<I, T, F, Fut>(ctx: &CallContext, requests: Vec<I>, options: BatchOptions, per_item: F) -> Vec<BatchResult<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let concurrency = options.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let per_item = Arc::new(per_item);
    let total = requests.len();

    let mut join_set: JoinSet<(usize, BatchResult<T>)> = JoinSet::new();

    for (index, item) in requests.into_iter().enumerate() {
        let item_ctx = ctx.child();
        let semaphore = semaphore.clone();
        let per_item = per_item.clone();

        join_set.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    return (
                        index,
                        BatchResult { input_index: index, value: None, err: Some(Error::cancelled("batch semaphore closed")) },
                    );
                }
            };

            if item_ctx.is_cancelled() {
                drop(permit);
                return (
                    index,
                    BatchResult { input_index: index, value: None, err: Some(Error::cancelled("batch cancelled before item started")) },
                );
            }

            let outcome = per_item(item_ctx, item).await;
            drop(permit);

            match outcome {
                Ok(value) => (index, BatchResult { input_index: index, value: Some(value), err: None }),
                Err(e) => (index, BatchResult { input_index: index, value: None, err: Some(e) }),
            }
        });
    }

    let mut slots: Vec<Option<BatchResult<T>>> = (0..total).map(|_| None).collect();

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(join_err) => {
                // A panicking task still needs a slot so the output stays
                // the same length as the input; we don't know its index
                // here, so this only matters if callers spawn panicking
                // item closures, which they control.
                tracing::error!(error = %join_err, "batch item task panicked");
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| slot.unwrap_or_else(|| BatchResult { input_index: i, value: None, err: Some(Error::cancelled("batch item task did not complete")) }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_input_order_in_results() {
        let ctx = CallContext::new();
        let requests: Vec<i32> = (0..25).collect();
        let results = execute_batch(&ctx, requests, BatchOptions { concurrency: 5 }, |_ctx, n| async move {
            if n == 3 {
                Err(Error::not_found(404, "{}"))
            } else {
                Ok(n * 2)
            }
        })
        .await;

        assert_eq!(results.len(), 25);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.input_index, i);
        }
        assert!(results[3].err.as_ref().unwrap().is_not_found());
        assert_eq!(results[4].value, Some(8));
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        let ctx = CallContext::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let requests: Vec<i32> = (0..20).collect();

        let in_flight_cl = in_flight.clone();
        let max_seen_cl = max_seen.clone();
        let results = execute_batch(&ctx, requests, BatchOptions { concurrency: 4 }, move |_ctx, n| {
            let in_flight = in_flight_cl.clone();
            let max_seen = max_seen_cl.clone();
            async move {
                let cur = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(cur, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Error>(n)
            }
        })
        .await;

        assert_eq!(results.len(), 20);
        assert!(max_seen.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn cancellation_marks_unstarted_items_cancelled() {
        let ctx = CallContext::new();
        ctx.cancel();
        let requests: Vec<i32> = (0..5).collect();
        let results = execute_batch(&ctx, requests, BatchOptions::default(), |_ctx, n| async move { Ok::<_, Error>(n) }).await;
        assert!(results.iter().all(|r| r.err.as_ref().is_some_and(|e| e.is_cancelled())));
    }
}
