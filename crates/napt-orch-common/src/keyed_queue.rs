//! Keyed work queue: one serial worker per key, bounded parallelism overall.
//!
//! All multi-step work for one entity (a router, a node) is submitted under
//! that entity's key. Items for the same key run strictly one after another
//! in submission order; items for different keys run in parallel, bounded by
//! the queue's worker permits. Each item is retried per the queue's
//! [`RetryPolicy`] when it fails with a retryable error.
//!
//! Workers are spawned on demand and exit once their key has no more work.
//! The idle check happens under the same lock `submit` takes, so an item is
//! either seen by the exiting worker or starts a fresh one.

use crate::retry::RetryPolicy;
use crate::task::{TaskError, TaskResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, warn};

/// Owned, sendable boxed future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A queued job. It is `FnMut` so the retry policy can run it again.
type Job = Box<dyn FnMut() -> BoxFuture<TaskResult<()>> + Send + 'static>;

struct WorkItem {
    label: String,
    job: Job,
    /// Overrides the queue's policy for this item
    retry: Option<RetryPolicy>,
    done: oneshot::Sender<TaskResult<()>>,
}

/// Handle on a submitted item's final outcome (after retries).
///
/// Dropping the ticket does not cancel the item.
#[derive(Debug)]
pub struct Ticket {
    rx: oneshot::Receiver<TaskResult<()>>,
}

impl Ticket {
    /// Waits for the item to finish and returns its last result.
    pub async fn wait(self) -> TaskResult<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(TaskError::internal("work item dropped before completion")))
    }
}

struct Inner<K> {
    name: String,
    workers: Mutex<HashMap<K, mpsc::UnboundedSender<WorkItem>>>,
    permits: Semaphore,
    retry: RetryPolicy,
    pending: AtomicUsize,
    idle: Notify,
}

impl<K> Inner<K> {
    fn workers(&self) -> MutexGuard<'_, HashMap<K, mpsc::UnboundedSender<WorkItem>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Work queue serializing items per key.
pub struct KeyedWorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for KeyedWorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for KeyedWorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedWorkQueue")
            .field("name", &self.inner.name)
            .field("pending", &self.inner.pending.load(Ordering::Acquire))
            .finish()
    }
}

impl<K> KeyedWorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    /// Creates a queue allowing at most `max_workers` items to run at once.
    pub fn new(name: impl Into<String>, max_workers: usize, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                workers: Mutex::new(HashMap::new()),
                permits: Semaphore::new(max_workers.max(1)),
                retry,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queues `job` behind any earlier work for `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, Fut>(&self, key: K, label: impl Into<String>, mut job: F) -> Ticket
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let job: Job = Box::new(move || Box::pin(job()) as BoxFuture<TaskResult<()>>);
        self.enqueue(key, label.into(), None, job)
    }

    /// Queues `job` behind earlier work for `key` and runs it exactly once,
    /// whatever the queue's retry policy.
    pub fn submit_once<F, Fut>(&self, key: K, label: impl Into<String>, job: F) -> Ticket
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let mut job = Some(job);
        let job: Job = Box::new(move || match job.take() {
            Some(job) => Box::pin(job()) as BoxFuture<TaskResult<()>>,
            None => Box::pin(async { Err(TaskError::internal("one-shot work item ran twice")) })
                as BoxFuture<TaskResult<()>>,
        });
        self.enqueue(key, label.into(), Some(RetryPolicy::no_retry()), job)
    }

    fn enqueue(&self, key: K, label: String, retry: Option<RetryPolicy>, job: Job) -> Ticket {
        let (done, rx) = oneshot::channel();
        let mut item = WorkItem {
            label,
            job,
            retry,
            done,
        };
        self.inner.pending.fetch_add(1, Ordering::AcqRel);

        let mut workers = self.inner.workers();
        if let Some(tx) = workers.get(&key) {
            match tx.send(item) {
                Ok(()) => return Ticket { rx },
                // The worker is gone without deregistering; replace it.
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }

        let (tx, worker_rx) = mpsc::unbounded_channel();
        // Receiver is alive until the worker task starts, send cannot fail.
        let _ = tx.send(item);
        workers.insert(key.clone(), tx);
        drop(workers);

        debug!(queue = %self.inner.name, %key, "spawning worker");
        tokio::spawn(run_worker(Arc::clone(&self.inner), key, worker_rx));
        Ticket { rx }
    }

    /// Number of items submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Keys that currently have a live worker.
    pub fn active_keys(&self) -> Vec<K> {
        self.inner.workers().keys().cloned().collect()
    }

    /// Resolves once every submitted item has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_worker<K>(inner: Arc<Inner<K>>, key: K, mut rx: mpsc::UnboundedReceiver<WorkItem>)
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    loop {
        let item = match rx.try_recv() {
            Ok(item) => item,
            Err(_) => {
                let mut workers = inner.workers();
                match rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => {
                        workers.remove(&key);
                        debug!(queue = %inner.name, %key, "worker idle, exiting");
                        return;
                    }
                }
            }
        };
        run_item(&inner, &key, item).await;
    }
}

async fn run_item<K: fmt::Display>(inner: &Inner<K>, key: &K, item: WorkItem) {
    let WorkItem {
        label,
        mut job,
        retry,
        done,
    } = item;

    let result = match inner.permits.acquire().await {
        Ok(_permit) => {
            let what = format!("{}/{}/{}", inner.name, key, label);
            retry.unwrap_or(inner.retry).run(&what, || job()).await
        }
        Err(_) => Err(TaskError::internal("work queue closed")),
    };

    if let Err(e) = &result {
        warn!(queue = %inner.name, %key, %label, status = %e.to_status(), error = %e, "work item failed");
    }
    // Receiver may have been dropped; the outcome is already logged.
    let _ = done.send(result);
    inner.finish_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn queue(workers: usize) -> KeyedWorkQueue<String> {
        KeyedWorkQueue::new("test", workers, RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_same_key_runs_in_order() {
        let q = queue(8);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut tickets = Vec::new();
        for i in 0..20u32 {
            let log = Arc::clone(&log);
            tickets.push(q.submit("r1".to_string(), format!("item-{i}"), move || {
                let log = Arc::clone(&log);
                async move {
                    // Yield so a concurrent runner would interleave
                    tokio::task::yield_now().await;
                    log.lock().unwrap().push(i);
                    Ok(())
                }
            }));
        }
        for t in tickets {
            t.wait().await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
        q.wait_idle().await;
        assert_eq!(q.pending(), 0);
    }

    #[tokio::test]
    async fn test_same_key_never_overlaps() {
        let q = queue(8);
        let running = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut tickets = Vec::new();
        for _ in 0..10 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            tickets.push(q.submit("r1".to_string(), "overlap", move || {
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }
        for t in tickets {
            t.wait().await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_in_parallel() {
        let q = queue(4);
        let gate = Arc::new(tokio::sync::Barrier::new(2));

        // Both items must be running at once to pass the barrier.
        let a = {
            let gate = Arc::clone(&gate);
            q.submit("r1".to_string(), "a", move || {
                let gate = Arc::clone(&gate);
                async move {
                    gate.wait().await;
                    Ok(())
                }
            })
        };
        let b = {
            let gate = Arc::clone(&gate);
            q.submit("r2".to_string(), "b", move || {
                let gate = Arc::clone(&gate);
                async move {
                    gate.wait().await;
                    Ok(())
                }
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            a.wait().await.unwrap();
            b.wait().await.unwrap();
        })
        .await
        .expect("distinct keys deadlocked");
    }

    #[tokio::test]
    async fn test_transient_failure_retried_bounded() {
        let q = queue(2);
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        let result = q
            .submit("r1".to_string(), "flaky", move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TaskError::transient("store unavailable"))
                }
            })
            .wait()
            .await;

        assert_eq!(result, Err(TaskError::transient("store unavailable")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_key() {
        let q = queue(2);

        let first = q.submit("r1".to_string(), "fails", || async {
            Err(TaskError::not_found("router r1"))
        });
        let second = q.submit("r1".to_string(), "ok", || async { Ok(()) });

        assert!(first.wait().await.is_err());
        assert_eq!(second.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_worker_exits_when_idle() {
        let q = queue(2);
        q.submit("r1".to_string(), "one", || async { Ok(()) })
            .wait()
            .await
            .unwrap();
        q.wait_idle().await;

        // The worker deregisters right after its last item.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !q.active_keys().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker never exited");

        // A fresh submit for the same key spawns a new worker.
        assert_eq!(
            q.submit("r1".to_string(), "two", || async { Ok(()) })
                .wait()
                .await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_submit_once_skips_retries() {
        let q = queue(2);
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        let result = q
            .submit_once("r1".to_string(), "flaky once", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::transient("store unavailable"))
            })
            .wait()
            .await;

        assert_eq!(result, Err(TaskError::transient("store unavailable")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
