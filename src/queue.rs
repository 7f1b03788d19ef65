//! A bounded, priority-ordered operation queue (§4.9).
//!
//! This is the "external collaborator" the spec otherwise treats as
//! injected: a generic priority queue, here with a concrete
//! implementation so the crate is runnable on its own. Submissions are
//! dispatched in priority order (ties broken FIFO) and run with bounded
//! concurrency; callers needing strict ordering between two operations
//! must chain via completion, exactly as §5 describes.
//!
//! Coalescing of same-identifier submissions is *not* implemented here —
//! the three reserved trim identifiers have hand-rolled merge semantics
//! that live in [`crate::cache`], next to the state they merge into,
//! guarded by the cache's own instance mutex.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background,
    Default,
    High,
}

struct Job {
    priority: Priority,
    seq: u64,
    run: Box<dyn FnOnce() -> BoxFuture + Send>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Job {}
impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority pops first, and
        // within a priority tier the earlier-submitted job (smaller seq)
        // pops first, so we reverse the seq comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A bounded-concurrency, priority-ordered queue of fire-and-forget
/// async jobs, backed by a single dispatcher task.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Inner>,
}

struct Inner {
    heap: Mutex<BinaryHeap<Job>>,
    notify: Notify,
    next_seq: AtomicU64,
    permits: Arc<tokio::sync::Semaphore>,
}

impl OperationQueue {
    /// `max_concurrency` bounds how many submitted jobs may be running
    /// at once; excess ready jobs wait in priority order.
    pub fn new(max_concurrency: usize) -> Self {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            permits: Arc::new(tokio::sync::Semaphore::new(max_concurrency)),
        });

        let dispatcher = inner.clone();
        tokio::spawn(async move {
            Self::dispatch_loop(dispatcher).await;
        });

        Self { inner }
    }

    /// Enqueues `job` at `priority`. Fire-and-forget: no handle to await
    /// completion is returned, matching the §4.9 contract's base
    /// `schedule(operation, priority)` form.
    pub fn schedule<F, Fut>(&self, priority: Priority, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let run: Box<dyn FnOnce() -> BoxFuture + Send> = Box::new(move || Box::pin(job()));
        self.inner.heap.lock().push(Job { priority, seq, run });
        self.inner.notify.notify_one();
    }

    async fn dispatch_loop(inner: Arc<Inner>) {
        loop {
            let next = inner.heap.lock().pop();
            let job = match next {
                Some(job) => job,
                None => {
                    inner.notify.notified().await;
                    continue;
                }
            };

            let permits = inner.permits.clone();
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed: queue shut down
            };

            tokio::spawn(async move {
                (job.run)().await;
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn runs_all_submitted_jobs() {
        let queue = OperationQueue::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = counter.clone();
            queue.schedule(Priority::Default, move || async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn high_priority_runs_before_queued_background_jobs() {
        // saturate the single permit with a long-running background job,
        // then enqueue a high priority job behind it: it must still run,
        // just after the permit frees up.
        let queue = OperationQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        queue.schedule(Priority::Background, move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            o1.lock().push("background");
        });

        tokio::time::sleep(Duration::from_millis(5)).await;

        let o2 = order.clone();
        queue.schedule(Priority::High, move || async move {
            o2.lock().push("high");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock(), vec!["background", "high"]);
    }
}
