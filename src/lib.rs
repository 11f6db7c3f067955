//! # rust-asyncpool
//!
//! `rust-asyncpool` is a bounded worker pool for async Rust applications.
//! A fixed number of workers pull jobs from a capacity-limited queue and run
//! them through a caller-supplied handler, so a producer can push a large
//! volume of jobs without unbounded memory growth.
//!
//! ## Features
//!
//! - Backpressure: `push` waits while `workers * (1 + load_factor)` jobs are
//!   queued or running
//! - Strict FIFO dispatch across all workers
//! - Optional per-job deadline that cancels only the offending job
//! - Optional per-job result handles
//! - Pool-wide failure record and submission counter
//! - Draining shutdown: `join` never drops a queued job
//!
//! ## Author
//!
//! Saeed Ghanbari (https://github.com/sgh370)

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::Future;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, info_span, Instrument};

mod failures;
mod gate;
mod worker;

pub use failures::JobFailure;

use failures::FailureLog;
use gate::BackpressureGate;
use worker::Worker;

/// Errors that can occur when using the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was constructed with an invalid configuration
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// A job ran longer than the configured `max_task_time`
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The job handler returned an error
    #[error("job failed: {0}")]
    JobFailed(String),

    /// The job handler panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    /// A job was pushed after the pool stopped accepting work
    #[error("pool is closed")]
    PoolClosed,

    /// A job was pushed after `job_accept_duration` elapsed since the first push
    #[error("pool stopped accepting jobs {0:?} after the first push")]
    AcceptWindowClosed(Duration),

    /// `join` found recorded failures and `raise_on_join` is set
    #[error("pool `{name}` recorded {count} failed job(s)")]
    JobsFailed {
        /// Pool name
        name: String,
        /// Number of recorded failures
        count: usize,
    },

    /// The job was dropped without producing a result
    #[error("job was cancelled")]
    Cancelled,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// The number of workers in the pool
    pub workers: usize,
    /// Label attached to every log event of the pool
    pub name: String,
    /// Queued jobs allowed per worker on top of the running ones
    pub load_factor: usize,
    /// Deadline for a single job; `None` lets jobs run unbounded
    pub max_task_time: Option<Duration>,
    /// Whether `push` returns a [`JobHandle`] for each job
    pub return_futures: bool,
    /// How long after the first push the pool keeps accepting jobs
    pub job_accept_duration: Option<Duration>,
    /// Make `join` fail if any job failed
    pub raise_on_join: bool,
    /// Log progress every n accepted pushes
    pub log_every_n: Option<usize>,
    /// Expected number of pushes, shown in progress logs
    pub expected_total: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            name: "pool".to_string(),
            load_factor: 1,
            max_task_time: None,
            return_futures: false,
            job_accept_duration: None,
            raise_on_join: false,
            log_every_n: None,
            expected_total: None,
        }
    }
}

impl PoolConfig {
    /// Defaults with the given worker count and name.
    pub fn new(workers: usize, name: impl Into<String>) -> Self {
        Self {
            workers,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set how many queued jobs each worker may have waiting behind it.
    pub fn with_load_factor(mut self, load_factor: usize) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Bound every job by `max_task_time`.
    pub fn with_max_task_time(mut self, max_task_time: Duration) -> Self {
        self.max_task_time = Some(max_task_time);
        self
    }

    /// Make `push` return a [`JobHandle`] per job.
    pub fn with_return_futures(mut self, return_futures: bool) -> Self {
        self.return_futures = return_futures;
        self
    }

    /// Refuse pushes once `duration` has passed since the first push.
    pub fn with_job_accept_duration(mut self, duration: Duration) -> Self {
        self.job_accept_duration = Some(duration);
        self
    }

    /// Make `join` return [`PoolError::JobsFailed`] if any job failed.
    pub fn with_raise_on_join(mut self, raise_on_join: bool) -> Self {
        self.raise_on_join = raise_on_join;
        self
    }

    /// Log an `info` event every `every_n` accepted pushes.
    pub fn with_progress_log(mut self, every_n: usize, expected_total: Option<usize>) -> Self {
        self.log_every_n = Some(every_n);
        self.expected_total = expected_total;
        self
    }

    /// Number of jobs that may be queued or running at the same time.
    pub fn capacity(&self) -> usize {
        self.workers.saturating_mul(self.load_factor.saturating_add(1))
    }

    /// Check the configuration for values the pool cannot run with.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 {
            return Err(PoolError::Configuration(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.capacity() > Semaphore::MAX_PERMITS {
            return Err(PoolError::Configuration(format!(
                "capacity {} exceeds the supported maximum of {}",
                self.capacity(),
                Semaphore::MAX_PERMITS
            )));
        }
        if self.max_task_time.is_some_and(|d| d.is_zero()) {
            return Err(PoolError::Configuration(
                "max_task_time must be greater than zero".to_string(),
            ));
        }
        if self.log_every_n == Some(0) {
            return Err(PoolError::Configuration(
                "log_every_n must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A job that can be submitted to the pool.
#[derive(Debug)]
pub(crate) struct Job<T, R> {
    /// The payload handed to the job handler
    pub task: T,
    /// The response channel to send the result back, if futures are enabled
    pub response_tx: Option<oneshot::Sender<Result<R, PoolError>>>,
}

impl<T, R> fmt::Display for Job<T, R>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({:?})", self.task)
    }
}

/// A handle to the outcome of one pushed job.
///
/// Resolved exactly once, by the worker that ran the job. Awaiting the handle
/// directly yields the same value as [`wait`](JobHandle::wait).
#[derive(Debug)]
pub struct JobHandle<R> {
    rx: oneshot::Receiver<Result<R, PoolError>>,
    outcome: Option<Result<R, PoolError>>,
}

impl<R> JobHandle<R> {
    fn new(rx: oneshot::Receiver<Result<R, PoolError>>) -> Self {
        Self { rx, outcome: None }
    }

    /// Whether the job has finished, without waiting.
    pub fn is_resolved(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.outcome = Some(result);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.outcome = Some(Err(PoolError::Cancelled));
                true
            }
        }
    }

    /// Wait for the job to complete.
    pub async fn wait(self) -> Result<R, PoolError> {
        self.await
    }

    /// Wait for the job to complete, giving up after `timeout_duration`.
    ///
    /// Giving up does not affect the job itself.
    pub async fn wait_timeout(self, timeout_duration: Duration) -> Result<R, PoolError> {
        match timeout(timeout_duration, self).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout(timeout_duration)),
        }
    }
}

// The outcome is never pinned, so the handle can move freely.
impl<R> Unpin for JobHandle<R> {}

impl<R> Future for JobHandle<R> {
    type Output = Result<R, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.outcome.take() {
            return Poll::Ready(outcome);
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => Poll::Ready(result.unwrap_or(Err(PoolError::Cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Running(Vec<JoinHandle<()>>),
    /// Gate closed; the receiver flips to `true` once every worker exited.
    Joining(watch::Receiver<bool>),
}

/// A bounded pool of async workers sharing one FIFO job queue.
pub struct WorkerPool<T, R, F, Fut>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, PoolError>> + Send + 'static,
{
    /// The configuration for the pool
    config: PoolConfig,
    /// The job handler function
    handler: Arc<F>,
    /// Admission queue shared with the workers
    gate: Arc<BackpressureGate<Job<T, R>>>,
    /// Failures recorded by the workers
    failures: Arc<FailureLog>,
    /// Accepted pushes over the pool's lifetime
    total_queued: AtomicUsize,
    /// Time of the first push, for `job_accept_duration`
    first_push: OnceLock<Instant>,
    /// Worker task handles
    lifecycle: Mutex<Lifecycle>,
    _phantom: std::marker::PhantomData<fn() -> Fut>,
}

impl<T, R, F, Fut> WorkerPool<T, R, F, Fut>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, PoolError>> + Send + 'static,
{
    /// Create a new pool with the given job handler and configuration.
    ///
    /// No worker runs until [`start`](Self::start) is called.
    pub fn new(job_handler: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        Ok(Self {
            gate: Arc::new(BackpressureGate::new(config.capacity())),
            handler: Arc::new(job_handler),
            failures: Arc::new(FailureLog::default()),
            total_queued: AtomicUsize::new(0),
            first_push: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
            config,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Build and start a pool, run `body` with it, then join the pool.
    ///
    /// The pool is joined even if `body` pushed nothing. The join error, if
    /// any, takes precedence over the body's output.
    pub async fn scope<B, BFut, O>(
        job_handler: F,
        config: PoolConfig,
        body: B,
    ) -> Result<O, PoolError>
    where
        B: FnOnce(Arc<Self>) -> BFut,
        BFut: Future<Output = O>,
    {
        let pool = Arc::new(Self::new(job_handler, config)?);
        pool.start();
        let out = body(pool.clone()).await;
        pool.join().await?;
        Ok(out)
    }

    /// Spawn the workers.
    ///
    /// # Panics
    ///
    /// Panics if the pool was already started or joined.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(
            matches!(*lifecycle, Lifecycle::Idle),
            "pool `{}` was already started",
            self.config.name
        );
        *lifecycle = Lifecycle::Running(self.spawn_workers());
    }

    fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    self.gate.clone(),
                    self.handler.clone(),
                    self.failures.clone(),
                    self.config.max_task_time,
                );
                let span = info_span!("worker", pool = %self.config.name, id);
                tokio::spawn(async move { worker.run().await }.instrument(span))
            })
            .collect()
    }

    /// Submit a job, waiting while the pool is at capacity.
    ///
    /// Returns a [`JobHandle`] when `return_futures` is set. Dropping the
    /// returned future before it completes leaves the pool untouched.
    pub async fn push(&self, task: T) -> Result<Option<JobHandle<R>>, PoolError> {
        if let Some(window) = self.config.job_accept_duration {
            let first = *self.first_push.get_or_init(Instant::now);
            if first.elapsed() > window {
                return Err(PoolError::AcceptWindowClosed(window));
            }
        }

        let (response_tx, handle) = if self.config.return_futures {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(JobHandle::new(rx)))
        } else {
            (None, None)
        };

        self.gate.enqueue(Job { task, response_tx }).await?;
        let total = self.total_queued.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(every_n) = self.config.log_every_n {
            if total % every_n == 0 {
                match self.config.expected_total {
                    Some(expected) => info!(
                        "pushed {}/{} items to {} pool",
                        total, expected, self.config.name
                    ),
                    None => info!("pushed {} items to {} pool", total, self.config.name),
                }
            }
        }

        Ok(handle)
    }

    /// Stop accepting jobs, run every queued job to completion, and wait for
    /// the workers to exit.
    ///
    /// A pool that was never started is started first so that jobs pushed
    /// before `join` still run. Every call, including concurrent ones and
    /// calls made after the drain finished, waits for the same drain and
    /// returns the same result. Dropping the returned future does not stop
    /// the drain.
    pub async fn join(&self) -> Result<(), PoolError> {
        let mut drained = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            let drained = match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                Lifecycle::Joining(drained) => drained,
                Lifecycle::Running(handles) => self.begin_drain(handles),
                Lifecycle::Idle => self.begin_drain(self.spawn_workers()),
            };
            *lifecycle = Lifecycle::Joining(drained.clone());
            drained
        };

        if drained.wait_for(|done| *done).await.is_err() {
            // The drain task was torn down with the runtime.
            debug!("Drain of {} ended early", self.config.name);
        }

        let count = self.failures.len();
        if self.config.raise_on_join && count > 0 {
            return Err(PoolError::JobsFailed {
                name: self.config.name.clone(),
                count,
            });
        }
        Ok(())
    }

    /// Close the gate and wait for the workers in a task of its own.
    fn begin_drain(&self, handles: Vec<JoinHandle<()>>) -> watch::Receiver<bool> {
        debug!("Joining {}", self.config.name);
        self.gate.close();

        let (done_tx, done_rx) = watch::channel(false);
        let name = self.config.name.clone();
        tokio::spawn(async move {
            for handle in handles {
                if let Err(err) = handle.await {
                    error!("Exception joining {}: {}", name, err);
                }
            }
            debug!("Completed {}", name);
            done_tx.send_replace(true);
        });
        done_rx
    }

    /// Accepted pushes over the pool's lifetime, not the current queue depth.
    pub fn total_queued(&self) -> usize {
        self.total_queued.load(Ordering::SeqCst)
    }

    /// Every failure recorded so far, oldest first.
    pub fn exceptions(&self) -> Vec<JobFailure> {
        self.failures.snapshot()
    }

    /// Whether any job has failed.
    pub fn has_exceptions(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.gate.queued()
    }

    /// Jobs currently being run by a worker.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Get the current number of available slots in the pool.
    pub fn available_capacity(&self) -> usize {
        self.gate.available()
    }

    /// Get the total capacity of the pool.
    pub fn total_capacity(&self) -> usize {
        self.gate.capacity()
    }

    /// Whether the pool has stopped accepting jobs.
    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// The pool's diagnostic label.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl<T, R, F, Fut> Drop for WorkerPool<T, R, F, Fut>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, PoolError>> + Send + 'static,
{
    fn drop(&mut self) {
        // Workers finish whatever is queued, then exit and release the handler.
        self.gate.close();
    }
}

impl<T, R, F, Fut> fmt::Debug for WorkerPool<T, R, F, Fut>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, PoolError>> + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("total_queued", &self.total_queued())
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
