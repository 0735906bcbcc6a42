//! Bounded worker pool.
//!
//! A run spawns at most `parallelism` workers that pull items from a shared
//! queue. Each call of the operation is bracketed by a semaphore permit, and
//! the semaphore belongs to the pool, so concurrent runs on one pool share
//! the same ceiling. Completed items flow through an unbounded channel that
//! closes once, after every worker has been joined.
//!
//! Workers may also fold their own items into a private partial aggregate;
//! partials are returned by [`PoolRun::join`] and never shared while the run
//! is in progress.

use crate::error::{Error, Result};
use futures::FutureExt;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Why an item produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
    /// The operation returned an error.
    Failed(E),
    /// The operation panicked; the payload message is kept.
    Panicked(String),
    /// The run was cancelled before or during the operation.
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => e.fmt(f),
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
            Self::Cancelled => f.write_str("task cancelled"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for TaskError<E> {}

/// One finished work item.
#[derive(Debug, Clone)]
pub struct Completed<I, R, E> {
    /// Position of the item in the submitted list
    pub index: usize,
    /// Worker that handled it; `None` if it never left the queue
    pub worker: Option<usize>,
    /// The item itself
    pub item: I,
    /// Value or failure
    pub outcome: std::result::Result<R, TaskError<E>>,
}

impl<I, R, E> Completed<I, R, E> {
    /// Returns true if the operation produced a value.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Fixed-ceiling executor for I/O-bound operations.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    parallelism: usize,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool allowing `parallelism` concurrent operations.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `parallelism` is zero.
    pub fn new(parallelism: usize) -> Result<Self> {
        if parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }
        Ok(Self {
            parallelism,
            permits: Arc::new(Semaphore::new(parallelism)),
            cancel: CancellationToken::new(),
        })
    }

    /// Stops every run of this pool once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Configured ceiling.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Permits not currently held by an operation.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Token observed by this pool's runs.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Applies `op` to every item.
    pub fn run<I, R, E, F, Fut>(&self, items: Vec<I>, op: F) -> PoolRun<I, R, E, ()>
    where
        I: Clone + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.run_folded(items, op, |(): &mut (), _: &Completed<I, R, E>| {})
    }

    /// Applies `op` to every item, folding each completion into the
    /// handling worker's own `A`.
    ///
    /// Items left in the queue by a cancellation are reported as
    /// [`TaskError::Cancelled`] and are not folded.
    #[instrument(skip_all, fields(items = items.len(), parallelism = self.parallelism))]
    pub fn run_folded<I, R, E, A, F, Fut, G>(&self, items: Vec<I>, op: F, fold: G) -> PoolRun<I, R, E, A>
    where
        I: Clone + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        A: Default + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        G: Fn(&mut A, &Completed<I, R, E>) + Send + Sync + 'static,
    {
        let total = items.len();
        let queue: Arc<Mutex<VecDeque<(usize, I)>>> =
            Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
        let (tx, rx) = mpsc::unbounded_channel();
        let op = Arc::new(op);
        let fold = Arc::new(fold);

        let worker_count = self.parallelism.min(total);
        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            workers.spawn(worker_loop(
                worker,
                Arc::clone(&queue),
                Arc::clone(&self.permits),
                self.cancel.clone(),
                Arc::clone(&op),
                Arc::clone(&fold),
                tx.clone(),
            ));
        }
        debug!(workers = worker_count, "Spawned pool workers");

        let handle = tokio::spawn(async move {
            let mut partials = Vec::with_capacity(worker_count);
            let mut failures = Vec::new();
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(partial) => partials.push(partial),
                    Err(e) => failures.push(Error::pool(format!("worker task failed: {e}"))),
                }
            }

            let leftover: Vec<(usize, I)> = queue.lock().await.drain(..).collect();
            if !leftover.is_empty() {
                warn!(count = leftover.len(), "Run cancelled with items still queued");
            }
            for (index, item) in leftover {
                let _ = tx.send(Completed {
                    index,
                    worker: None,
                    item,
                    outcome: Err(TaskError::Cancelled),
                });
            }
            // Last sender: the result stream closes here, after the join.
            drop(tx);

            partials.sort_by_key(|(worker, _)| *worker);
            match failures.len() {
                0 => Ok(partials.into_iter().map(|(_, partial)| partial).collect()),
                1 => Err(failures.remove(0)),
                _ => Err(Error::multiple(failures)),
            }
        });

        PoolRun {
            total,
            results: rx,
            handle,
        }
    }
}

async fn worker_loop<I, R, E, A, F, Fut, G>(
    worker: usize,
    queue: Arc<Mutex<VecDeque<(usize, I)>>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    op: Arc<F>,
    fold: Arc<G>,
    tx: mpsc::UnboundedSender<Completed<I, R, E>>,
) -> (usize, A)
where
    I: Clone + Send + 'static,
    A: Default,
    F: Fn(I) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
    G: Fn(&mut A, &Completed<I, R, E>),
{
    let mut partial = A::default();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some((index, item)) = queue.lock().await.pop_front() else {
            break;
        };

        let outcome = {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            match permit {
                None => Err(TaskError::Cancelled),
                Some(_permit) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => Err(TaskError::Cancelled),
                        outcome = guarded_call(op.as_ref(), item.clone()) => outcome,
                    }
                }
            }
        };

        let completed = Completed {
            index,
            worker: Some(worker),
            item,
            outcome,
        };
        fold(&mut partial, &completed);
        if tx.send(completed).is_err() {
            debug!(worker, index, "Result receiver dropped");
        }
    }

    (worker, partial)
}

/// Runs `op` to completion, turning a panic (while building or polling the
/// future) into [`TaskError::Panicked`].
async fn guarded_call<I, R, E, F, Fut>(op: &F, item: I) -> std::result::Result<R, TaskError<E>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| op(item))) {
        Ok(fut) => fut,
        Err(payload) => return Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Handle on an in-progress run.
#[derive(Debug)]
pub struct PoolRun<I, R, E, A> {
    total: usize,
    results: mpsc::UnboundedReceiver<Completed<I, R, E>>,
    handle: JoinHandle<Result<Vec<A>>>,
}

impl<I, R, E, A> PoolRun<I, R, E, A> {
    /// Number of submitted items.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Next completion in arrival order; `None` once the run is over.
    pub async fn next(&mut self) -> Option<Completed<I, R, E>> {
        self.results.recv().await
    }

    /// Result stream, for handing to a sink.
    pub fn results(&mut self) -> &mut mpsc::UnboundedReceiver<Completed<I, R, E>> {
        &mut self.results
    }

    /// Waits for every worker and returns their partials, ordered by worker.
    ///
    /// Completions not yet received remain readable until `self` is dropped,
    /// so call this after draining [`Self::results`].
    ///
    /// # Errors
    ///
    /// Returns a pool error if a worker task itself failed.
    pub async fn join(self) -> Result<Vec<A>> {
        self.handle
            .await
            .map_err(|e| Error::pool(format!("pool controller failed: {e}")))?
    }

    /// Drains every completion, then joins.
    ///
    /// # Errors
    ///
    /// Returns a pool error if a worker task itself failed.
    pub async fn collect(mut self) -> Result<(Vec<Completed<I, R, E>>, Vec<A>)> {
        let mut completed = Vec::with_capacity(self.total);
        while let Some(item) = self.results.recv().await {
            completed.push(item);
        }
        let partials = self.join().await?;
        Ok((completed, partials))
    }
}
