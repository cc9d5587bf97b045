//! Fixed-size worker-pool dispatcher.
//!
//! A pool owns `threads` long-lived worker threads draining one shared
//! injector queue. Workers execute continuously and concurrently; there is
//! no ordering guarantee across workers. Shutdown is graceful (accepted
//! work still runs) and idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use thiserror::Error;

use crate::dispatch::{Dispatcher, ExecutorRef};
use crate::task::Runnable;
use crate::topology::{self, CpuConfig};
use crate::trace::{debug, info, warn};

/// Default thread-name prefix; worker `i` is named `{name}-{i}`.
const DEFAULT_POOL_NAME: &str = "cadence-worker";

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads; must be at least 1.
    pub threads: usize,
    /// Pool name, used as the worker thread-name prefix.
    pub name: String,
    /// CPU pinning policy for the workers.
    pub cpu: CpuConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            name: DEFAULT_POOL_NAME.to_string(),
            cpu: CpuConfig::default(),
        }
    }
}

/// Error constructing or submitting to a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The configured thread count was zero.
    #[error("worker pool requires at least one thread (got {got})")]
    InvalidThreadCount {
        /// The rejected thread count.
        got: usize,
    },
    /// The pool has been shut down; it no longer accepts work.
    #[error("worker pool is shut down")]
    Shutdown,
}

/// Shared state between the pool handle and its workers.
pub(crate) struct PoolShared {
    name: String,
    queue: SegQueue<Runnable>,
    shutdown: AtomicBool,
    /// Parking for idle workers; producers notify under the lock so a wake
    /// cannot slip between a worker's empty-check and its wait.
    park_mutex: Mutex<()>,
    park_condvar: Condvar,
    threads: usize,
}

impl PoolShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn enqueue(&self, runnable: Runnable) {
        if self.shutdown.load(Ordering::Acquire) {
            // Wakes racing past shutdown cannot run; terminate the task
            // observably rather than dropping it on the floor.
            match runnable {
                Runnable::Task(task) => {
                    warn!(pool = %self.name, "wake after shutdown; task cancelled");
                    task.finish_cancelled();
                }
                Runnable::Thunk(_) => {
                    warn!(pool = %self.name, "closure reached a shut-down pool; dropped");
                }
            }
            return;
        }
        self.queue.push(runnable);
        let _guard = self.park_mutex.lock().expect("pool park lock poisoned");
        self.park_condvar.notify_one();
    }

    fn worker_loop(&self) {
        debug!(pool = %self.name, "worker started");
        loop {
            if let Some(runnable) = self.queue.pop() {
                runnable.run();
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let guard = self.park_mutex.lock().expect("pool park lock poisoned");
            if self.queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                drop(
                    self.park_condvar
                        .wait(guard)
                        .expect("pool park lock poisoned"),
                );
            }
        }
        debug!(pool = %self.name, "worker exiting");
    }
}

/// A fixed-size pool of worker threads usable as an alternate execution
/// context.
///
/// # Example
///
/// ```
/// use cadence::WorkerPool;
///
/// let pool = WorkerPool::new(4).unwrap();
/// assert_eq!(pool.thread_count(), 4);
/// pool.submit(|| { /* heavy work off the main thread */ }).unwrap();
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with `threads` workers and default naming, no pinning.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidThreadCount`] if `threads` is zero.
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        Self::with_config(WorkerPoolConfig {
            threads,
            ..WorkerPoolConfig::default()
        })
    }

    /// Creates a single-threaded pool. Work submitted to it runs in
    /// submission order, since only one worker drains the queue.
    #[must_use]
    pub fn single() -> Self {
        Self::new(1).expect("a single-threaded pool is always a valid configuration")
    }

    /// Creates a pool from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidThreadCount`] if `config.threads` is zero.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned.
    pub fn with_config(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.threads == 0 {
            return Err(PoolError::InvalidThreadCount { got: 0 });
        }

        let placement = config.cpu.resolve(config.threads);
        info!(pool = %config.name, threads = config.threads, "worker pool starting");

        let shared = Arc::new(PoolShared {
            name: config.name,
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            park_mutex: Mutex::new(()),
            park_condvar: Condvar::new(),
            threads: config.threads,
        });

        let mut handles = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let worker = Arc::clone(&shared);
            let core = placement.cores.get(index).copied().flatten();
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", worker.name))
                .spawn(move || {
                    if let Some(core) = core
                        && !topology::pin_to_core(core)
                    {
                        warn!(pool = %worker.name, core, "failed to pin worker to core");
                    }
                    worker.worker_loop();
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Number of worker threads owned by this pool.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.threads
    }

    /// Submits a closure to run on some worker.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Shutdown`] if the pool has been shut down.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        self.shared.enqueue(Runnable::Thunk(Box::new(f)));
        Ok(())
    }

    /// Public handle for launching work on this pool.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(ExecutorRef::Pool(Arc::clone(&self.shared)))
    }

    /// Shuts the pool down and joins every worker. Idempotent.
    ///
    /// Work accepted before shutdown still runs; workers exit once the queue
    /// is drained. New submissions are refused with
    /// [`PoolError::Shutdown`]. Must not be called from one of the pool's
    /// own workers.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.shared.name, "worker pool shutting down");

        {
            let _guard = self.shared.park_mutex.lock().expect("pool park lock poisoned");
            self.shared.park_condvar.notify_all();
        }

        let handles = std::mem::take(&mut *self.handles.lock().expect("pool handle lock poisoned"));
        for handle in handles {
            let _ = handle.join();
        }

        // Anything that raced in after the last worker exited cannot run;
        // terminate it observably.
        while let Some(runnable) = self.shared.queue.pop() {
            match runnable {
                Runnable::Task(task) => task.finish_cancelled(),
                Runnable::Thunk(_) => {
                    warn!(pool = %self.shared.name, "queued closure discarded at shutdown");
                }
            }
        }
        info!(pool = %self.shared.name, "worker pool shutdown complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal shutdown if not already done; explicit shutdown() joins.
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            let _guard = self.shared.park_mutex.lock().expect("pool park lock poisoned");
            self.shared.park_condvar.notify_all();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("threads", &self.shared.threads)
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn thread_count_matches_configuration() {
        let pool = WorkerPool::new(4).unwrap();
        assert_eq!(pool.thread_count(), 4);
        pool.shutdown();

        let single = WorkerPool::single();
        assert_eq!(single.thread_count(), 1);
        single.shutdown();
    }

    #[test]
    fn zero_threads_is_a_configuration_error() {
        let err = WorkerPool::new(0).unwrap_err();
        assert_eq!(err, PoolError::InvalidThreadCount { got: 0 });
    }

    #[test]
    fn submitted_work_runs_off_the_submitting_thread() {
        let pool = WorkerPool::single();
        let submitter = thread::current().id();
        let executed_on = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&executed_on);
        pool.submit(move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        })
        .unwrap();
        pool.shutdown();

        let executed_on = executed_on.lock().unwrap().expect("work must have run");
        assert_ne!(executed_on, submitter);
    }

    #[test]
    fn workers_carry_the_configured_pool_name() {
        let pool = WorkerPool::with_config(WorkerPoolConfig {
            threads: 1,
            name: "render-io".to_string(),
            cpu: CpuConfig::Disabled,
        })
        .unwrap();

        let observed = Arc::new(Mutex::new(String::new()));
        let slot = Arc::clone(&observed);
        pool.submit(move || {
            *slot.lock().unwrap() = thread::current().name().unwrap_or("").to_string();
        })
        .unwrap();
        pool.shutdown();

        assert_eq!(*observed.lock().unwrap(), "render-io-0");
    }

    #[test]
    fn single_worker_preserves_submission_order() {
        let pool = WorkerPool::single();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..32 {
            let order = Arc::clone(&order);
            pool.submit(move || order.lock().unwrap().push(i)).unwrap();
        }
        pool.shutdown();

        assert_eq!(*order.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_accepted_work() {
        let pool = WorkerPool::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                thread::sleep(Duration::from_micros(100));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let pool = WorkerPool::single();
        pool.shutdown();

        let err = pool.submit(|| {}).unwrap_err();
        assert_eq!(err, PoolError::Shutdown);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = WorkerPool::new(3).unwrap();
        pool.shutdown();
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn panicking_work_does_not_kill_the_worker() {
        let pool = WorkerPool::single();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("worker entry fails")).unwrap();
        let counter = Arc::clone(&ran);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
