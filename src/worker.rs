use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{Future, FutureExt};
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::failures::{FailureLog, JobFailure};
use crate::gate::BackpressureGate;
use crate::Job;
use crate::PoolError;

/// A worker that runs jobs from the pool's gate until it is closed and empty.
pub(crate) struct Worker<T, R, F> {
    /// The worker's unique identifier
    id: usize,
    /// Where jobs come from
    gate: Arc<BackpressureGate<Job<T, R>>>,
    /// The handler function to process jobs
    handler: Arc<F>,
    /// Shared failure record of the owning pool
    failures: Arc<FailureLog>,
    /// Deadline for a single handler call
    max_task_time: Option<Duration>,
}

impl<T, R, F, Fut> Worker<T, R, F>
where
    T: Send + fmt::Debug + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, PoolError>> + Send + 'static,
{
    pub(crate) fn new(
        id: usize,
        gate: Arc<BackpressureGate<Job<T, R>>>,
        handler: Arc<F>,
        failures: Arc<FailureLog>,
        max_task_time: Option<Duration>,
    ) -> Self {
        Self {
            id,
            gate,
            handler,
            failures,
            max_task_time,
        }
    }

    /// Run the worker, processing jobs until the gate is closed and drained.
    pub(crate) async fn run(self) {
        info!("{} started", self);

        while let Some(mut slot) = self.gate.dequeue().await {
            let Some(job) = slot.take() else {
                continue;
            };
            trace!("{} received job: {}", self, job);

            self.process(job).await;
            // Frees the gate slot only after the job's outcome is delivered.
            drop(slot);
        }

        info!("{} shutting down", self);
    }

    async fn process(&self, job: Job<T, R>) {
        let Job { task, response_tx } = job;
        let payload = format!("{:?}", task);

        let handler = self.handler.clone();
        let call = AssertUnwindSafe(async move { handler(task).await }).catch_unwind();

        let outcome = match self.max_task_time {
            Some(limit) => match timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(PoolError::Timeout(limit))),
            },
            None => call.await,
        };
        let result =
            outcome.unwrap_or_else(|panic| Err(PoolError::Panicked(panic_message(&*panic))));

        if let Err(err) = &result {
            if response_tx.is_some() {
                debug!("Worker {} job {} failed: {}", self.id, payload, err);
            } else {
                error!("Worker {} job {} failed: {}", self.id, payload, err);
            }
            self.failures.record(JobFailure {
                error: err.clone(),
                payload,
                worker: self.id,
            });
        }

        if let Some(response_tx) = response_tx {
            if response_tx.send(result).is_err() {
                debug!("Failed to send job result: receiver dropped");
            }
        }
    }
}

impl<T, R, F> fmt::Display for Worker<T, R, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker({})", self.id)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
