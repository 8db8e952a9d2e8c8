use super::{
    errors::{BoxError, ConfigError, JobError},
    handle::{Job, Task},
    model::{Config, PoolMetrics},
    worker::{spawn_worker, Counters, Generation, ShutdownReason},
};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use std::{
    fmt, io,
    sync::{atomic::Ordering, Arc, Weak},
    thread,
    time::Duration,
};
use tracing::{debug, error, trace};

const ENQUEUE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Fixed-size pool of worker threads consuming a bounded queue of [`Job`]s.
///
/// `Pool` is a cheap, cloneable handle. Dropping the last handle closes the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Config,
    name_prefix: Arc<str>,
    counters: Arc<Counters>,
    /// Single serialization point of the pool. Submitters take it shared to
    /// check `closed` and enqueue; cancel/close/reset take it exclusively, so
    /// nothing is enqueued into a queue that is being drained or replaced.
    state: RwLock<PoolState>,
}

/// Sending halves of the current generation. Dropping them is what closes it.
struct PoolState {
    closed: bool,
    jobs: Option<Sender<Task>>,
    /// Unbounded staging area in front of `jobs`, drained by the generation's forwarder.
    overflow: Option<Sender<Task>>,
    shutdown: Option<Sender<()>>,
    generation: Arc<Generation>,
}

impl Pool {
    /// Creates a pool with `workers` threads and a queue of `2 * workers`.
    pub fn new(workers: usize) -> Result<Self, ConfigError> {
        Self::with_config(Config::new(workers))
    }

    pub fn with_config(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            name_prefix: Arc::from(config.thread_name_prefix.as_str()),
            counters: Arc::new(Counters::default()),
            state: RwLock::new(PoolState::retired()),
            config,
        });
        let state = inner.start_generation(1).map_err(ConfigError::WorkerSpawn)?;
        *inner.state.write() = state;

        Ok(Self { inner })
    }

    /// Queues `work` and returns its handle right away.
    ///
    /// The caller never waits for room in the queue: when it is full the job
    /// is staged and a per-generation forwarder moves it into the queue later.
    /// A job submitted to a closed pool is resolved with [`JobError::PoolClosed`].
    pub fn queue<T, F, E>(&self, work: F) -> Job<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&Job<T>) -> Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        let job = Job::new(work);
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let state = self.inner.state.read();
        self.inner.submit(&state, job.task());

        job
    }

    /// Closes the pool and resolves every still-queued job with [`JobError::Cancelled`].
    ///
    /// Running jobs are not interrupted. Call [`Pool::reset`] to use the pool again.
    pub fn cancel(&self) {
        self.inner.shut_down(ShutdownReason::Cancel);
    }

    /// Like [`Pool::cancel`], but queued jobs get [`JobError::PoolClosed`].
    pub fn close(&self) {
        self.inner.shut_down(ShutdownReason::Close);
    }

    /// Brings a closed pool back with a fresh queue and worker set. No-op on an open pool.
    pub fn reset(&self) {
        let mut state = self.inner.state.write();
        if !state.closed {
            return;
        }

        let next = state.generation.id + 1;
        match self.inner.start_generation(next) {
            Ok(fresh) => *state = fresh,
            Err(err) => error!(%err, generation = next, "reset failed to start workers, pool stays closed"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.inner.config.workers
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.read().generation.id
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.state.read();
        let counters = &self.inner.counters;
        PoolMetrics {
            workers: self.inner.config.workers,
            generation: state.generation.id,
            closed: state.closed,
            live_workers: state.generation.live_workers.load(Ordering::Acquire),
            queued_jobs: state.generation.jobs.len(),
            staged_jobs: state.generation.staged.load(Ordering::Acquire),
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            panicked: counters.panicked.load(Ordering::Relaxed),
            drained: counters.drained.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            workers_replaced: counters.workers_replaced.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Pool")
            .field("workers", &self.inner.config.workers)
            .field("generation", &state.generation.id)
            .field("closed", &state.closed)
            .finish()
    }
}

impl PoolState {
    /// Placeholder used only while the first generation is being built.
    fn retired() -> Self {
        let (_, jobs) = channel::bounded(0);
        let (_, shutdown) = channel::bounded(0);
        Self {
            closed: true,
            jobs: None,
            overflow: None,
            shutdown: None,
            generation: Arc::new(Generation::new(0, jobs, shutdown)),
        }
    }
}

impl PoolInner {
    fn start_generation(self: &Arc<Self>, id: u64) -> io::Result<PoolState> {
        let capacity = self.config.effective_queue_capacity();
        let (jobs_tx, jobs_rx) = channel::bounded(capacity);
        let (overflow_tx, overflow_rx) = channel::unbounded();
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        let generation = Arc::new(Generation::new(id, jobs_rx, shutdown_rx));

        // Dropping the senders on error stops whatever threads already started.
        let state = PoolState {
            closed: false,
            jobs: Some(jobs_tx),
            overflow: Some(overflow_tx),
            shutdown: Some(shutdown_tx),
            generation: Arc::clone(&generation),
        };

        let pool = Arc::downgrade(self);
        let staged_for = Arc::clone(&generation);
        thread::Builder::new()
            .name(format!("{}-overflow-{}", self.name_prefix, id))
            .spawn(move || forward_overflow(pool, staged_for, overflow_rx))?;

        for _ in 0..self.config.workers {
            spawn_worker(
                Arc::clone(&generation),
                Arc::clone(&self.counters),
                Arc::clone(&self.name_prefix),
            )?;
        }

        debug!(
            generation = id,
            workers = self.config.workers,
            capacity,
            "pool generation started"
        );
        Ok(state)
    }

    /// Puts `task` in the queue, or in the overflow when the queue is full.
    /// Once anything is staged, new tasks are staged behind it to keep FIFO order.
    fn submit(&self, state: &PoolState, task: Task) {
        let (Some(jobs), Some(overflow)) = (&state.jobs, &state.overflow) else {
            return self.reject(task);
        };
        if state.closed {
            return self.reject(task);
        }

        let staged = &state.generation.staged;
        let task = if staged.load(Ordering::Acquire) > 0 {
            task
        } else {
            match jobs.try_send(task) {
                Ok(()) => return,
                Err(TrySendError::Full(task)) => task,
                Err(TrySendError::Disconnected(task)) => return self.reject(task),
            }
        };

        staged.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = overflow.send(task) {
            staged.fetch_sub(1, Ordering::AcqRel);
            self.reject(err.into_inner());
        }
    }

    /// Moves one staged task of `generation` into its queue. The shared guard
    /// is released between attempts so a pending shutdown is never held up by
    /// a full queue. A task whose generation is gone is resolved with the
    /// generation's shutdown error.
    fn enqueue_staged(&self, generation: &Arc<Generation>, mut task: Task) {
        loop {
            let state = self.state.read();
            let jobs = match &state.jobs {
                Some(jobs) if !state.closed && Arc::ptr_eq(&state.generation, generation) => jobs,
                _ => return self.drain_staged(generation, task),
            };

            match jobs.send_timeout(task, ENQUEUE_RETRY_INTERVAL) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(t)) => task = t,
                Err(SendTimeoutError::Disconnected(t)) => return self.drain_staged(generation, t),
            }
        }
    }

    fn drain_staged(&self, generation: &Generation, task: Task) {
        let err = generation.shutdown_error().unwrap_or(JobError::PoolClosed);
        if task.abort(err) {
            self.counters.drained.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reject(&self, task: Task) {
        if task.abort(JobError::PoolClosed) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn shut_down(&self, reason: ShutdownReason) {
        let mut state = self.state.write();

        if !state.closed {
            state.closed = true;
            // reason first, then the signal, then the queue
            state.generation.mark_shutdown(reason);
            drop(state.shutdown.take());
            drop(state.overflow.take());
            drop(state.jobs.take());
            debug!(generation = state.generation.id, ?reason, "pool shut down");
        }

        let err = reason.error();
        let drained = state
            .generation
            .jobs
            .try_iter()
            .filter(|task| task.abort(err.clone()))
            .count();

        if drained > 0 {
            self.counters.drained.fetch_add(drained, Ordering::Relaxed);
            debug!(generation = state.generation.id, drained, "drained queued jobs");
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shut_down(ShutdownReason::Close);
    }
}

/// Body of a generation's overflow thread. Runs until the generation is shut
/// down and every staged task has been either queued or resolved.
fn forward_overflow(pool: Weak<PoolInner>, generation: Arc<Generation>, overflow: Receiver<Task>) {
    for task in overflow.iter() {
        match pool.upgrade() {
            Some(inner) => inner.enqueue_staged(&generation, task),
            None => {
                task.abort(JobError::PoolClosed);
            }
        }
        generation.staged.fetch_sub(1, Ordering::AcqRel);
    }
    trace!(generation = generation.id, "overflow forwarder retired");
}
