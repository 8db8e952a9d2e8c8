use std::{error::Error as StdError, io, sync::Arc};
use thiserror::Error;

/// Error type a work function may return, boxed so any error converts into it.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Terminal error of a job.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Cancelled, per job or pool-wide, before the job committed to its result.
    #[error("job cancelled")]
    Cancelled,

    /// Submitted to, or still queued in, a pool that had been closed.
    #[error("job added or run after the pool had been closed or cancelled")]
    PoolClosed,

    /// The work function panicked.
    #[error("job failed due to a recoverable error: '{message}'\nstack trace:\n{stack}")]
    Recovery { message: String, stack: String },

    /// The work function returned an error of its own.
    #[error(transparent)]
    Failed(Arc<dyn StdError + Send + Sync + 'static>),
}

impl JobError {
    pub(crate) fn failed(err: BoxError) -> Self {
        JobError::Failed(Arc::from(err))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    #[inline]
    pub fn is_pool_closed(&self) -> bool {
        matches!(self, JobError::PoolClosed)
    }

    #[inline]
    pub fn is_recovery(&self) -> bool {
        matches!(self, JobError::Recovery { .. })
    }
}

/// Fatal error raised while building a pool.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid workers '0'")]
    ZeroWorkers,

    #[error("invalid queue capacity '0'")]
    ZeroQueueCapacity,

    #[error("failed to spawn worker thread")]
    WorkerSpawn(#[source] io::Error),
}
