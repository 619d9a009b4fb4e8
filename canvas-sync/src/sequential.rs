//! Sequential update queue.
//!
//! Runs async tasks one at a time in submission order so that rapid related
//! writes (two position updates for the same object) cannot land out of
//! order. Each caller gets its own task's outcome back; a failing or
//! panicking task is logged and the next one still runs.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a sequenced task produced no value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError<E> {
    /// The task ran and returned an error.
    #[error("task failed: {0}")]
    Failed(E),
    /// The task panicked.
    #[error("task panicked")]
    Panicked,
    /// The task was discarded before it could report (runtime shut down).
    #[error("task dropped before completion")]
    Dropped,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueueInner {
    scope: String,
    jobs: Mutex<VecDeque<Job>>,
    processing: AtomicBool,
}

impl QueueInner {
    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Wrap `task` so its outcome is reported through the returned future.
fn package<F, T, E>(
    scope: &str,
    task: F,
) -> (Job, impl Future<Output = Result<T, TaskError<E>>> + Send + 'static)
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let scope = scope.to_string();
    let job: Job = Box::pin(async move {
        let result = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(scope = %scope, error = %e, "Sequenced task failed");
                Err(TaskError::Failed(e))
            }
            Err(_) => {
                tracing::error!(scope = %scope, "Sequenced task panicked");
                Err(TaskError::Panicked)
            }
        };
        // The caller may have stopped waiting.
        let _ = tx.send(result);
    });
    (job, async move { rx.await.unwrap_or(Err(TaskError::Dropped)) })
}

/// One-at-a-time async executor for a single resource scope.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SequentialQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for SequentialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialQueue")
            .field("scope", &self.inner.scope)
            .field("pending", &self.pending())
            .field("processing", &self.is_processing())
            .finish()
    }
}

impl SequentialQueue {
    /// Create an empty queue labelled `scope` in logs.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                scope: scope.into(),
                jobs: Mutex::new(VecDeque::new()),
                processing: AtomicBool::new(false),
            }),
        }
    }

    /// Append `task` and return a future for its outcome.
    ///
    /// The position in the queue is fixed when `enqueue` is called, not
    /// when the returned future is first polled. Must be called from within
    /// a tokio runtime.
    pub fn enqueue<F, T, E>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, TaskError<E>>> + Send + 'static
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (job, outcome) = package(&self.inner.scope, task);
        self.inner.lock_jobs().push_back(job);
        Self::drain(&self.inner);
        outcome
    }

    fn drain(inner: &Arc<QueueInner>) {
        if inner.processing.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            loop {
                let next = inner.lock_jobs().pop_front();
                if let Some(job) = next {
                    job.await;
                    continue;
                }
                inner.processing.store(false, Ordering::Release);
                // A job pushed between the empty check and the flag reset
                // would otherwise sit until the next enqueue.
                if inner.lock_jobs().is_empty() || inner.processing.swap(true, Ordering::AcqRel) {
                    break;
                }
            }
        });
    }

    /// Tasks waiting to run (excluding the running one).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock_jobs().len()
    }

    /// Whether a drain loop is active.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Whether nothing is queued or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.is_processing() && self.pending() == 0
    }
}

/// A [`SequentialQueue`] per resource scope, created on first use.
#[derive(Debug, Default, Clone)]
pub struct SequentialQueues {
    queues: Arc<Mutex<HashMap<String, SequentialQueue>>>,
}

impl SequentialQueues {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, SequentialQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The queue for `scope`.
    #[must_use]
    pub fn queue_for(&self, scope: &str) -> SequentialQueue {
        self.lock_queues()
            .entry(scope.to_string())
            .or_insert_with(|| SequentialQueue::new(scope))
            .clone()
    }

    /// Enqueue `task` on the queue for `scope`.
    ///
    /// The job is pushed while the registry is locked, so [`prune_idle`]
    /// can never forget a queue that is about to receive work.
    ///
    /// [`prune_idle`]: Self::prune_idle
    pub fn enqueue<F, T, E>(
        &self,
        scope: &str,
        task: F,
    ) -> impl Future<Output = Result<T, TaskError<E>>> + Send + 'static
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (job, outcome) = package(scope, task);
        let queue = {
            let mut queues = self.lock_queues();
            let queue = queues
                .entry(scope.to_string())
                .or_insert_with(|| SequentialQueue::new(scope))
                .clone();
            queue.inner.lock_jobs().push_back(job);
            queue
        };
        SequentialQueue::drain(&queue.inner);
        outcome
    }

    /// Forget queues with nothing queued or running. Returns how many went.
    pub fn prune_idle(&self) -> usize {
        let mut queues = self.lock_queues();
        let before = queues.len();
        queues.retain(|_, queue| !queue.is_idle());
        before - queues.len()
    }

    /// Number of live scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_queues().len()
    }

    /// Whether no scope has a queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
