use super::errors::ConfigError;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    /// Bound of the pending-job queue. `None` means twice the worker count.
    pub queue_capacity: Option<usize>,
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 2, // for I/O-bound jobs
            queue_capacity: None,
            thread_name_prefix: "workpool".to_string(),
        }
    }
}

impl Config {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    pub fn cpu_bound() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 2,
            queue_capacity: Some(num_cpus * 20),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    #[inline]
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.workers * 2)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.effective_queue_capacity() == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// Point-in-time counters of a pool, accumulated across generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    pub workers: usize,
    pub generation: u64,
    pub closed: bool,
    pub live_workers: usize,
    pub queued_jobs: usize,
    /// Jobs accepted while the queue was full, not yet moved into it.
    pub staged_jobs: usize,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub panicked: usize,
    /// Jobs force-resolved by cancel/close, including those a worker refused after shutdown.
    pub drained: usize,
    /// Jobs submitted while the pool was closed.
    pub rejected: usize,
    pub workers_replaced: usize,
}

impl PoolMetrics {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.panicked
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.finished();
        if total == 0 {
            return 1.0;
        }
        self.completed as f64 / total as f64
    }

    pub fn queue_pressure(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        (self.queued_jobs + self.staged_jobs) as f64 / self.workers as f64
    }
}
