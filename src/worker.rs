//! Worker threads.
//!
//! Every worker belongs to exactly one [`Generation`]: it consumes that
//! generation's queue and exits when the generation's shutdown channel is
//! disconnected. A worker whose job panics resolves the job with
//! [`JobError::Recovery`], starts a replacement in the same generation and exits.

use super::{
    errors::JobError,
    handle::{RunOutcome, Task},
};
use crossbeam::channel::Receiver;
use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Once,
    },
    thread,
};
use tracing::{debug, error, trace};

/// Upper bound for the stack trace carried by a recovery error.
pub const MAX_STACK_TRACE_BYTES: usize = 7000;

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(1);
static PANIC_HOOK: Once = Once::new();

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Why a generation was shut down; decides the error given to jobs it drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ShutdownReason {
    Cancel = 1,
    Close = 2,
}

impl ShutdownReason {
    pub(crate) fn error(self) -> JobError {
        match self {
            ShutdownReason::Cancel => JobError::Cancelled,
            ShutdownReason::Close => JobError::PoolClosed,
        }
    }
}

const OPEN: u8 = 0;

/// Counters shared by every generation of a pool.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicUsize,
    pub(crate) completed: AtomicUsize,
    pub(crate) failed: AtomicUsize,
    pub(crate) panicked: AtomicUsize,
    pub(crate) drained: AtomicUsize,
    pub(crate) rejected: AtomicUsize,
    pub(crate) workers_replaced: AtomicUsize,
}

/// The receiving half of one queue + shutdown signal pair, shared by its workers.
pub(crate) struct Generation {
    pub(crate) id: u64,
    pub(crate) jobs: Receiver<Task>,
    shutdown: Receiver<()>,
    reason: AtomicU8,
    pub(crate) live_workers: AtomicUsize,
    /// Tasks waiting in the overflow for room in `jobs`.
    pub(crate) staged: AtomicUsize,
}

impl Generation {
    pub(crate) fn new(id: u64, jobs: Receiver<Task>, shutdown: Receiver<()>) -> Self {
        Self {
            id,
            jobs,
            shutdown,
            reason: AtomicU8::new(OPEN),
            live_workers: AtomicUsize::new(0),
            staged: AtomicUsize::new(0),
        }
    }

    /// Must happen before the shutdown sender is dropped so that workers
    /// never see a closed signal without a reason.
    pub(crate) fn mark_shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason.compare_exchange(
            OPEN,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn shutdown_error(&self) -> Option<JobError> {
        match self.reason.load(Ordering::Acquire) {
            OPEN => None,
            r if r == ShutdownReason::Cancel as u8 => Some(JobError::Cancelled),
            _ => Some(JobError::PoolClosed),
        }
    }
}

enum Exit {
    Shutdown,
    Faulted,
}

struct Worker {
    id: usize,
    generation: Arc<Generation>,
    counters: Arc<Counters>,
    name_prefix: Arc<str>,
}

/// Starts one worker thread bound to `generation`.
pub(crate) fn spawn_worker(
    generation: Arc<Generation>,
    counters: Arc<Counters>,
    name_prefix: Arc<str>,
) -> io::Result<()> {
    install_panic_hook();

    let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
    generation.live_workers.fetch_add(1, Ordering::AcqRel);

    let worker = Worker {
        id,
        generation: Arc::clone(&generation),
        counters,
        name_prefix: Arc::clone(&name_prefix),
    };

    let spawned = thread::Builder::new()
        .name(format!("{}-{}", name_prefix, id))
        .spawn(move || worker.run());

    if let Err(err) = spawned {
        generation.live_workers.fetch_sub(1, Ordering::AcqRel);
        return Err(err);
    }
    Ok(())
}

impl Worker {
    fn run(self) {
        IN_WORKER.with(|flag| flag.set(true));
        debug!(worker_id = self.id, generation = self.generation.id, "worker started");

        match self.work_loop() {
            Exit::Shutdown => {
                trace!(worker_id = self.id, generation = self.generation.id, "worker retired");
            }
            Exit::Faulted => {
                self.counters.workers_replaced.fetch_add(1, Ordering::Relaxed);
                match spawn_worker(
                    Arc::clone(&self.generation),
                    Arc::clone(&self.counters),
                    Arc::clone(&self.name_prefix),
                ) {
                    Ok(()) => debug!(
                        worker_id = self.id,
                        generation = self.generation.id,
                        "worker replaced after job panic"
                    ),
                    Err(err) => error!(
                        worker_id = self.id,
                        generation = self.generation.id,
                        %err,
                        "failed to spawn replacement worker"
                    ),
                }
            }
        }

        self.generation.live_workers.fetch_sub(1, Ordering::AcqRel);
    }

    fn work_loop(&self) -> Exit {
        let generation = &*self.generation;
        loop {
            crossbeam::select! {
                recv(generation.jobs) -> msg => {
                    // A disconnected queue wakes the select with Err; that is not a job.
                    let Ok(task) = msg else { continue };

                    if let Some(err) = generation.shutdown_error() {
                        if task.abort(err) {
                            self.counters.drained.fetch_add(1, Ordering::Relaxed);
                        }
                        continue;
                    }

                    // cancelled while queued
                    if !task.is_ready_for_work() {
                        task.abort(JobError::Cancelled);
                        continue;
                    }

                    if !self.execute(task) {
                        return Exit::Faulted;
                    }
                }
                recv(generation.shutdown) -> _ => return Exit::Shutdown,
            }
        }
    }

    /// Returns false if the job panicked.
    fn execute(&self, task: Task) -> bool {
        PANIC_STACK.with(|slot| slot.borrow_mut().take());

        let job = Arc::clone(&task);
        match panic::catch_unwind(AssertUnwindSafe(move || job.run())) {
            Ok(RunOutcome::Completed) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(RunOutcome::Failed) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(RunOutcome::Discarded) => true,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let stack = PANIC_STACK
                    .with(|slot| slot.borrow_mut().take())
                    .unwrap_or_else(|| Backtrace::force_capture().to_string());

                task.fail(JobError::Recovery {
                    message,
                    stack: truncate_stack(stack),
                });
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                trace!(worker_id = self.id, job_id = task.id(), "job panicked");
                false
            }
        }
    }
}

/// Chains a hook in front of the current one. Panics on worker threads only
/// have their stack recorded; they reach callers through the job's error and
/// are not reported. Every other panic goes to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !record_worker_panic() {
                previous(info);
            }
        }));
    });
}

/// Stores the current stack for the panic boundary. False off worker threads.
fn record_worker_panic() -> bool {
    if !IN_WORKER.try_with(Cell::get).unwrap_or(false) {
        return false;
    }
    let stack = Backtrace::force_capture().to_string();
    PANIC_STACK
        .try_with(|slot| *slot.borrow_mut() = Some(stack))
        .is_ok()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn truncate_stack(mut stack: String) -> String {
    if stack.len() > MAX_STACK_TRACE_BYTES {
        let mut end = MAX_STACK_TRACE_BYTES;
        while !stack.is_char_boundary(end) {
            end -= 1;
        }
        stack.truncate(end);
    }
    stack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u32), "non-string panic payload");
    }

    #[test]
    fn stack_is_truncated_on_char_boundary() {
        let stack = "é".repeat(MAX_STACK_TRACE_BYTES);
        let truncated = truncate_stack(stack);
        assert!(truncated.len() <= MAX_STACK_TRACE_BYTES);
        assert!(truncated.chars().all(|c| c == 'é'));

        assert_eq!(truncate_stack("short".into()), "short");
    }

    #[test]
    fn only_worker_panics_are_recorded() {
        let off_worker = thread::spawn(|| {
            let recorded = record_worker_panic();
            (recorded, PANIC_STACK.with(|slot| slot.borrow_mut().take()))
        })
        .join()
        .unwrap();
        assert_eq!(off_worker, (false, None));

        let (recorded, stack) = thread::spawn(|| {
            IN_WORKER.with(|flag| flag.set(true));
            let recorded = record_worker_panic();
            (recorded, PANIC_STACK.with(|slot| slot.borrow_mut().take()))
        })
        .join()
        .unwrap();
        assert!(recorded);
        assert!(stack.is_some());
    }

    #[test]
    fn shutdown_reason_is_set_once() {
        let (_jobs_tx, jobs_rx) = crossbeam::channel::bounded(1);
        let (_stop_tx, stop_rx) = crossbeam::channel::bounded(0);
        let generation = Generation::new(1, jobs_rx, stop_rx);

        assert!(generation.shutdown_error().is_none());
        generation.mark_shutdown(ShutdownReason::Cancel);
        generation.mark_shutdown(ShutdownReason::Close);
        assert!(generation.shutdown_error().is_some_and(|e| e.is_cancelled()));
    }
}
