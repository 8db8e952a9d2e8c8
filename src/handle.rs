use super::errors::{BoxError, JobError};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, OnceLock,
    },
};
use tokio_util::sync::CancellationToken;

pub(crate) type WorkFn<T> = Box<dyn FnOnce(&Job<T>) -> Result<T, BoxError> + Send + 'static>;

/// Type-erased job as it travels through the queue.
pub(crate) type Task = Arc<dyn Runnable>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// What happened to a job a worker picked up and ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Failed,
    /// Cancelled while running; the computed result was dropped.
    Discarded,
}

/// Operations a worker and the pool need on a queued job, independent of its value type.
pub(crate) trait Runnable: Send + Sync {
    fn id(&self) -> u64;

    fn is_ready_for_work(&self) -> bool;

    /// Runs the work function and publishes its result if the job was not
    /// cancelled in the meantime. Panics from the work function propagate.
    fn run(self: Arc<Self>) -> RunOutcome;

    /// Cancellation path: resolves with `err` unless the job already committed or resolved.
    fn cancel_with(&self, err: JobError) -> bool;

    /// Worker path after a fault: commits and publishes `err` unless already cancelled.
    fn fail(&self, err: JobError) -> bool;

    /// Resolves a job a worker decided not to run, ignoring any commitment.
    fn abort(&self, err: JobError) -> bool;
}

// One-way latches, packed so the commit/cancel race is decided by a single CAS.
const COMMITTING: u8 = 0b001;
const CANCEL_REQUESTED: u8 = 0b010;
const CANCELLED: u8 = 0b100;

struct JobState(AtomicU8);

impl JobState {
    fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    #[inline]
    fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Sets `COMMITTING` and returns the previous bits.
    #[inline]
    fn commit(&self) -> u8 {
        self.0.fetch_or(COMMITTING, Ordering::AcqRel)
    }

    /// Records a cancel request. Returns true if this call won the job,
    /// i.e. it was neither committed nor already cancelled.
    fn request_cancel(&self) -> bool {
        let mut cur = self.load();
        loop {
            let wins = cur & (COMMITTING | CANCELLED) == 0;
            let next = if wins {
                cur | CANCEL_REQUESTED | CANCELLED
            } else {
                cur | CANCEL_REQUESTED
            };
            if next == cur {
                return false;
            }
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return wins,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Sets `CANCELLED` regardless of commitment. Returns true if it was unset.
    #[inline]
    fn force_cancel(&self) -> bool {
        self.0.fetch_or(CANCEL_REQUESTED | CANCELLED, Ordering::AcqRel) & CANCELLED == 0
    }
}

struct JobInner<T> {
    id: u64,
    work: Mutex<Option<WorkFn<T>>>,
    outcome: OnceLock<Result<T, JobError>>,
    state: JobState,
    /// Fired once, right after `outcome` is written.
    done: CancellationToken,
}

impl<T> JobInner<T> {
    /// Only called by the side that won the job.
    fn finish(&self, result: Result<T, JobError>) {
        let _ = self.outcome.set(result);
        self.done.cancel();
    }

    fn publish(&self, result: Result<T, JobError>) -> bool {
        if self.state.commit() & CANCELLED != 0 {
            return false;
        }
        self.finish(result);
        true
    }
}

impl<T: Send + Sync + 'static> Runnable for JobInner<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_ready_for_work(&self) -> bool {
        self.state.load() & (CANCEL_REQUESTED | CANCELLED) == 0
    }

    fn run(self: Arc<Self>) -> RunOutcome {
        let job = Job { inner: self };
        let Some(work) = job.inner.work.lock().take() else {
            return RunOutcome::Discarded;
        };

        let result = work(&job).map_err(JobError::failed);
        let outcome = if result.is_ok() {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed
        };

        if job.inner.publish(result) {
            outcome
        } else {
            RunOutcome::Discarded
        }
    }

    fn cancel_with(&self, err: JobError) -> bool {
        if self.state.request_cancel() {
            self.finish(Err(err));
            return true;
        }
        false
    }

    fn fail(&self, err: JobError) -> bool {
        self.publish(Err(err))
    }

    fn abort(&self, err: JobError) -> bool {
        if self.state.force_cancel() {
            self.finish(Err(err));
            return true;
        }
        false
    }
}

/// Handle to a queued unit of work.
///
/// Cloning is cheap; every clone observes the same job. The work function
/// receives a handle too, so it can check [`Job::is_cancelled`] while running.
pub struct Job<T> {
    inner: Arc<JobInner<T>>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("state", &format_args!("{:#05b}", self.inner.state.load()))
            .field("resolved", &self.inner.done.is_cancelled())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Job<T> {
    pub(crate) fn new<F, E>(work: F) -> Self
    where
        F: FnOnce(&Job<T>) -> Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        let work: WorkFn<T> = Box::new(move |job: &Job<T>| work(job).map_err(Into::into));
        Self {
            inner: Arc::new(JobInner {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                work: Mutex::new(Some(work)),
                outcome: OnceLock::new(),
                state: JobState::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn task(&self) -> Task {
        self.inner.clone()
    }

    /// Requests cancellation.
    ///
    /// Resolves the job with [`JobError::Cancelled`] unless it has already
    /// committed to its result or been resolved, in which case the request is
    /// only recorded.
    #[inline]
    pub fn cancel(&self) {
        self.inner.cancel_with(JobError::Cancelled);
    }

    /// Reports whether the job was cancelled, and commits it.
    ///
    /// Once this returns `false` the job can no longer be cancelled: whatever
    /// the work function returns will be published. When it returns `true`
    /// the cancellation outcome is already readable.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.state.commit() & CANCELLED != 0 {
            self.wait();
            return true;
        }
        false
    }

    /// True while the job has been neither cancelled nor asked to cancel.
    #[inline]
    pub fn is_ready_for_work(&self) -> bool {
        self.inner.is_ready_for_work()
    }
}

impl<T> Job<T> {
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Blocks the current thread until the job is resolved.
    pub fn wait(&self) {
        if self.is_resolved() {
            return;
        }
        futures::executor::block_on(self.inner.done.cancelled());
    }

    /// Resolves once the job is resolved. Works on any executor.
    pub async fn wait_async(&self) {
        self.inner.done.cancelled().await
    }

    /// The job's value, if it resolved successfully.
    #[inline]
    pub fn value(&self) -> Option<&T> {
        self.outcome().and_then(|r| r.as_ref().ok())
    }

    /// The job's terminal error, if any.
    #[inline]
    pub fn error(&self) -> Option<&JobError> {
        self.outcome().and_then(|r| r.as_ref().err())
    }

    #[inline]
    pub fn outcome(&self) -> Option<&Result<T, JobError>> {
        self.inner.outcome.get()
    }
}
