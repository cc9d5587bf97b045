//! The tick-bound main dispatcher.
//!
//! Work is pushed from any thread into an unbounded FIFO; the render loop
//! drains it by calling [`MainDispatcher::flush`] exactly once per tick from
//! the thread it wants designated "main". The queue is snapshotted at the
//! start of each flush, so anything enqueued while a flush is running
//! (including re-enqueues from [`skip_tick`]) executes no earlier than the
//! next flush. That single property bounds the per-tick workload and gives
//! frame-skip its "strictly after the current flush" guarantee.

use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread;

use minstant::Instant;

use crate::dispatch::{Dispatcher, ExecutorRef};
use crate::identity::ThreadRegistry;
use crate::task::Runnable;
use crate::trace::{info, trace};

/// Shared state behind cloneable [`MainDispatcher`] handles.
pub(crate) struct MainShared {
    registry: ThreadRegistry,
    queue: Mutex<VecDeque<Runnable>>,
    /// Completed flushes; advances by exactly 1 at the end of each flush.
    ticks: AtomicU64,
    /// Total queue entries executed across all flushes.
    executed: AtomicU64,
    /// Drain duration of the most recent flush, in microseconds.
    last_flush_us: AtomicU64,
}

impl MainShared {
    pub(crate) fn enqueue(&self, runnable: Runnable) {
        self.queue
            .lock()
            .expect("tick queue lock poisoned")
            .push_back(runnable);
    }
}

thread_local! {
    /// True while a flush is draining on this thread; the legality gate for
    /// [`skip_tick`] and the reentrancy guard for [`MainDispatcher::flush`].
    static IN_FLUSH: Cell<bool> = const { Cell::new(false) };
}

struct FlushGuard;

impl FlushGuard {
    fn enter() -> Self {
        IN_FLUSH.with(|flag| {
            assert!(!flag.get(), "flush() called reentrantly from inside a flush");
            flag.set(true);
        });
        Self
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        IN_FLUSH.with(|flag| flag.set(false));
    }
}

/// The tick-bound, thread-affine dispatcher.
///
/// Cheap to clone; all clones share one queue and one identity registry.
/// The global runtime owns the process-wide instance (see
/// [`main_dispatcher`](crate::main_dispatcher)); embedders and tests may
/// construct private instances.
///
/// # Example
///
/// ```
/// use cadence::{MainDispatcher, Scope};
///
/// let main = MainDispatcher::new();
/// let scope = Scope::local(main.dispatcher());
/// let handle = scope.launch(async { 2 + 2 });
///
/// main.flush(); // normally driven by the render loop, once per tick
/// assert_eq!(handle.join().unwrap(), 4);
/// ```
#[derive(Clone)]
pub struct MainDispatcher {
    shared: Arc<MainShared>,
}

impl MainDispatcher {
    /// Creates a dispatcher with an empty queue and no main thread
    /// designated yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MainShared {
                registry: ThreadRegistry::new(),
                queue: Mutex::new(VecDeque::new()),
                ticks: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                last_flush_us: AtomicU64::new(0),
            }),
        }
    }

    /// Designates the calling thread as this dispatcher's main thread.
    ///
    /// Optional: the first [`flush`](MainDispatcher::flush) registers its
    /// calling thread automatically.
    ///
    /// # Panics
    ///
    /// Panics if a different thread was already registered.
    pub fn register(&self) {
        self.shared.registry.register();
    }

    /// Returns true if the calling thread is this dispatcher's registered
    /// main thread. Returns false before registration.
    #[must_use]
    pub fn on_main_thread(&self) -> bool {
        self.shared.registry.current_is_main()
    }

    /// Enqueues a fire-and-forget closure to run on the main thread during a
    /// later flush.
    ///
    /// Callable from any thread, including a task already running on the
    /// main thread; returns immediately. The queue is unbounded.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.enqueue(Runnable::Thunk(Box::new(f)));
    }

    /// Drains and executes every entry present in the queue at the moment
    /// the flush begins, synchronously and in enqueue order.
    ///
    /// Called by the render loop exactly once per tick. Entries enqueued by
    /// side effects of the running flush are deferred to the next flush. A
    /// panicking entry is contained per entry; the remaining entries of the
    /// same flush still run.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the registered main
    /// thread (the first call registers its thread), or reentrantly from
    /// inside a flush.
    pub fn flush(&self) {
        if !self.shared.registry.is_registered() {
            self.shared.registry.register();
            info!(thread = ?thread::current().id(), "main thread registered by first flush");
        }
        assert!(
            self.shared.registry.current_is_main(),
            "flush() called from {:?} but the main thread is {:?}",
            thread::current().id(),
            self.shared.registry.main_thread()
        );
        let _guard = FlushGuard::enter();

        let batch = {
            let mut queue = self.shared.queue.lock().expect("tick queue lock poisoned");
            mem::take(&mut *queue)
        };

        let started = Instant::now();
        let drained = batch.len() as u64;
        for runnable in batch {
            runnable.run();
        }

        self.shared.executed.fetch_add(drained, Ordering::Relaxed);
        self.shared.last_flush_us.store(
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        let tick = self.shared.ticks.fetch_add(1, Ordering::Release) + 1;
        trace!(
            tick,
            drained,
            elapsed_us = self.shared.last_flush_us.load(Ordering::Relaxed),
            "flush complete"
        );
    }

    /// Number of completed flushes. Advances by exactly 1 per flush, so with
    /// one flush per render tick this mirrors the external tick counter.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    /// Entries currently waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().expect("tick queue lock poisoned").len()
    }

    /// Total entries executed across all flushes.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Drain duration of the most recent flush, in microseconds.
    #[must_use]
    pub fn last_flush_micros(&self) -> u64 {
        self.shared.last_flush_us.load(Ordering::Relaxed)
    }

    /// Public handle for launching work on this dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(ExecutorRef::Main(Arc::clone(&self.shared)))
    }

    /// Runs `f` on the main thread and returns its result, blocking the
    /// caller until the block has run.
    ///
    /// When called on the main thread itself the block runs inline;
    /// otherwise it is enqueued and the caller parks until a flush executes
    /// it. A panic inside the block is re-raised in the caller.
    pub fn with_main<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.on_main_thread() {
            return f();
        }

        struct Relay<R> {
            result: Mutex<Option<thread::Result<R>>>,
            condvar: Condvar,
        }

        let relay = Arc::new(Relay {
            result: Mutex::new(None),
            condvar: Condvar::new(),
        });
        let remote = Arc::clone(&relay);
        self.submit(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            {
                let mut slot = remote.result.lock().expect("relay lock poisoned");
                *slot = Some(result);
            }
            remote.condvar.notify_all();
        });

        let mut slot = relay.result.lock().expect("relay lock poisoned");
        loop {
            if let Some(result) = slot.take() {
                match result {
                    Ok(value) => return value,
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            slot = relay.condvar.wait(slot).expect("relay lock poisoned");
        }
    }
}

impl Default for MainDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MainDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainDispatcher")
            .field("registered", &self.shared.registry.is_registered())
            .field("pending", &self.pending())
            .field("ticks", &self.ticks())
            .finish()
    }
}

/// Suspends the calling unit of work until a subsequent flush.
///
/// The continuation is re-enqueued onto the tick queue after the current
/// flush's snapshot, so it resumes strictly after the current flush. With
/// one flush per render tick, the tick counter observed after resumption is
/// exactly one higher than before the call.
///
/// # Panics
///
/// Panics when awaited anywhere other than a task executing inside a main
/// dispatcher flush. Inside a task the panic surfaces through the owning
/// scope's failure channel like any other task failure.
///
/// # Example
///
/// ```
/// use cadence::{MainDispatcher, Scope, skip_tick};
///
/// let main = MainDispatcher::new();
/// let scope = Scope::local(main.dispatcher());
/// let counter = main.clone();
/// let handle = scope.launch(async move {
///     let before = counter.ticks();
///     skip_tick().await;
///     counter.ticks() - before
/// });
///
/// main.flush();
/// main.flush();
/// assert_eq!(handle.join().unwrap(), 1);
/// ```
#[must_use = "futures do nothing unless awaited"]
pub fn skip_tick() -> SkipTick {
    SkipTick { yielded: false }
}

/// Future returned by [`skip_tick`].
#[must_use = "futures do nothing unless awaited"]
pub struct SkipTick {
    yielded: bool,
}

impl Future for SkipTick {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        assert!(
            IN_FLUSH.with(Cell::get),
            "skip_tick() may only be awaited from a task running on the main thread"
        );
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            // The wake lands after this flush's snapshot, deferring the
            // resumption to a later flush.
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn thunks_run_in_submission_order() {
        let main = MainDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let order = Arc::clone(&order);
            main.submit(move || order.lock().unwrap().push(i));
        }
        assert_eq!(main.pending(), 8);
        main.flush();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(main.pending(), 0);
        assert_eq!(main.executed(), 8);
    }

    #[test]
    fn work_enqueued_during_flush_defers_to_next_flush() {
        let main = MainDispatcher::new();
        let ran_at = Arc::new(Mutex::new(Vec::new()));

        let inner_main = main.clone();
        let inner_ran = Arc::clone(&ran_at);
        main.submit(move || {
            let nested_main = inner_main.clone();
            let nested_ran = Arc::clone(&inner_ran);
            inner_main.submit(move || nested_ran.lock().unwrap().push(nested_main.ticks()));
            inner_ran.lock().unwrap().push(inner_main.ticks());
        });

        main.flush();
        assert_eq!(main.pending(), 1, "nested submit must not run this flush");
        main.flush();

        let ran_at = ran_at.lock().unwrap();
        assert_eq!(*ran_at, vec![0, 1], "nested thunk ran one tick later");
    }

    #[test]
    fn ticks_advance_by_one_per_flush() {
        let main = MainDispatcher::new();
        assert_eq!(main.ticks(), 0);
        main.flush();
        main.flush();
        main.flush();
        assert_eq!(main.ticks(), 3);
    }

    #[test]
    fn panicking_thunk_does_not_stop_the_drain() {
        let main = MainDispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));

        main.submit(|| panic!("first entry fails"));
        let counter = Arc::clone(&ran);
        main.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        main.flush();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_flush_registers_the_calling_thread() {
        let main = MainDispatcher::new();
        assert!(!main.on_main_thread());
        main.flush();
        assert!(main.on_main_thread());
    }

    #[test]
    fn flush_from_wrong_thread_panics() {
        let main = MainDispatcher::new();
        main.flush();

        let remote = main.clone();
        let result = thread::spawn(move || remote.flush()).join();
        assert!(result.is_err(), "flush off the main thread must panic");
        assert_eq!(main.ticks(), 1);
    }

    #[test]
    fn with_main_runs_inline_on_the_main_thread() {
        let main = MainDispatcher::new();
        main.register();
        let value = main.with_main(|| 5);
        assert_eq!(value, 5);
        assert_eq!(main.pending(), 0, "inline path must not enqueue");
    }

    #[test]
    fn skip_tick_resumes_exactly_one_flush_later() {
        let main = MainDispatcher::new();
        let scope = Scope::local(main.dispatcher());
        main.register();

        let counter = main.clone();
        let handle = scope.launch(async move {
            let before = counter.ticks();
            skip_tick().await;
            (before, counter.ticks())
        });

        main.flush();
        assert!(!handle.is_finished(), "must not resume within the same flush");
        main.flush();

        let (before, after) = handle.join().unwrap();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn consecutive_skips_each_cost_one_flush() {
        let main = MainDispatcher::new();
        let scope = Scope::local(main.dispatcher());
        main.register();

        let counter = main.clone();
        let handle = scope.launch(async move {
            let start = counter.ticks();
            skip_tick().await;
            skip_tick().await;
            skip_tick().await;
            counter.ticks() - start
        });

        for _ in 0..4 {
            main.flush();
        }
        assert_eq!(handle.join().unwrap(), 3);
    }

    #[test]
    fn skip_tick_off_main_is_a_task_failure() {
        // Polling the future outside a flush must fail fast; do it through a
        // pool task so the panic surfaces as a join error.
        let main = MainDispatcher::new();
        let pool = crate::WorkerPool::single();
        let scope = Scope::local(main.dispatcher());

        let handle = scope.launch_on(&pool.dispatcher(), async {
            skip_tick().await;
        });
        let failure = handle.join().unwrap_err();
        assert!(failure.is_panic());
        pool.shutdown();
    }

    #[test]
    fn tasks_and_thunks_share_one_fifo() {
        let main = MainDispatcher::new();
        let scope = Scope::local(main.dispatcher());
        main.register();

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        main.submit(move || first.lock().unwrap().push("thunk-a"));
        let second = Arc::clone(&order);
        let handle = scope.launch(async move {
            second.lock().unwrap().push("task");
        });
        let third = Arc::clone(&order);
        main.submit(move || third.lock().unwrap().push("thunk-b"));

        main.flush();
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["thunk-a", "task", "thunk-b"]);
    }
}
