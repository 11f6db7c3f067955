use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::PoolError;

/// A job that did not complete successfully.
#[derive(Debug, Clone)]
pub struct JobFailure {
    /// What went wrong
    pub error: PoolError,
    /// `Debug` rendering of the payload the job was pushed with
    pub payload: String,
    /// The worker that ran the job
    pub worker: usize,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} failed on {}: {}",
            self.worker, self.payload, self.error
        )
    }
}

/// Append-only log of every failure observed by a pool's workers.
#[derive(Debug, Default)]
pub(crate) struct FailureLog {
    entries: Mutex<Vec<JobFailure>>,
}

impl FailureLog {
    pub(crate) fn record(&self, failure: JobFailure) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }

    pub(crate) fn snapshot(&self) -> Vec<JobFailure> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
