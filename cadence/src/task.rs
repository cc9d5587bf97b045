//! Task state machine, wakers, and join handles.
//!
//! A unit of work is a pinned future wrapped in a [`RawTask`]. The task owns
//! an atomic scheduling state that guarantees the single-execution invariant:
//! a task is never present in a dispatcher queue twice and is never polled
//! concurrently. Wakes arriving while the task is mid-poll are recorded and
//! turned into a re-enqueue after the poll returns, which is exactly what
//! makes frame-skip resumption land on a later flush.
//!
//! # State machine
//!
//! ```text
//!        wake                 dequeue              Poll::Pending
//! IDLE ───────▶ QUEUED ───────────────▶ RUNNING ───────────────▶ IDLE
//!                                          │  ▲                    │
//!                       wake while polling │  │ re-enqueue         │ wake
//!                                          ▼  │                    ▼
//!                                       NOTIFIED               QUEUED ...
//!
//! RUNNING ──Poll::Ready / panic / cancel──▶ DONE (terminal)
//! ```
//!
//! Polls run inside `catch_unwind`; a panicking task completes its join slot
//! with the preserved payload and never disturbs the dispatcher loop.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use thiserror::Error;

use crate::dispatch::ExecutorRef;
use crate::scope::{self, ScopeInner};
use crate::trace::error;

/// Not queued anywhere; a wake transitions to `QUEUED`.
const IDLE: u8 = 0;
/// Sitting in a dispatcher queue awaiting execution.
const QUEUED: u8 = 1;
/// Currently being polled by an executor thread.
const RUNNING: u8 = 2;
/// Woken while polling; re-enqueued once the poll returns.
const NOTIFIED: u8 = 3;
/// Terminal: completed, panicked, or cancelled.
const DONE: u8 = 4;

/// A queue entry: either a pollable task or a fire-and-forget closure.
///
/// Both kinds share one FIFO per dispatcher so closures and task polls
/// interleave in exact submission order.
pub(crate) enum Runnable {
    Task(Arc<RawTask>),
    Thunk(Box<dyn FnOnce() + Send>),
}

impl Runnable {
    /// Executes the entry, containing any panic.
    ///
    /// A panicking thunk is caught and reported; the default panic hook has
    /// already printed the payload by the time it reaches us, so the failure
    /// is observable even with tracing compiled out.
    pub(crate) fn run(self) {
        match self {
            Runnable::Task(task) => RawTask::run(&task),
            Runnable::Thunk(f) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                    report_thunk_panic(payload.as_ref());
                }
            }
        }
    }
}

#[cfg(feature = "tracing")]
fn report_thunk_panic(payload: &(dyn Any + Send)) {
    error!(panic = %panic_message(payload), "submitted closure panicked");
}

#[cfg(not(feature = "tracing"))]
fn report_thunk_panic(_payload: &(dyn Any + Send)) {}

/// Best-effort human-readable rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}

/// Type-erased completion sink attached to a task.
///
/// The typed value path runs inside the wrapped future itself; this trait
/// covers the two completions the executor must deliver without polling:
/// cancellation and panic.
pub(crate) trait Completion: Send + Sync {
    fn cancelled(&self);
    fn panicked(&self, payload: Box<dyn Any + Send>);
}

/// A scheduled unit of work: pinned future plus scheduling state.
pub(crate) struct RawTask {
    state: AtomicU8,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    completion: Arc<dyn Completion>,
    scope: Arc<ScopeInner>,
    exec: ExecutorRef,
    /// Whether a panic notifies the owning scope. Continuation sub-tasks
    /// (dispatcher switches) relay the payload to the awaiting task instead,
    /// which then fails the scope itself when it re-raises.
    notify_scope_on_panic: bool,
}

impl RawTask {
    pub(crate) fn new(
        future: impl Future<Output = ()> + Send + 'static,
        completion: Arc<dyn Completion>,
        scope: Arc<ScopeInner>,
        exec: ExecutorRef,
        notify_scope_on_panic: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(IDLE),
            future: Mutex::new(Some(Box::pin(future))),
            completion,
            scope,
            exec,
            notify_scope_on_panic,
        })
    }

    /// Enqueues the task on its dispatcher if it is not already queued.
    ///
    /// Safe to call from any thread at any time; this is the waker entry
    /// point. A wake during a poll is deferred until the poll returns.
    pub(crate) fn schedule(task: &Arc<Self>) {
        loop {
            match task.state.load(Ordering::Acquire) {
                IDLE => {
                    if task
                        .state
                        .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        task.exec.enqueue(Runnable::Task(Arc::clone(task)));
                        return;
                    }
                }
                RUNNING => {
                    if task
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                // QUEUED and NOTIFIED already guarantee a future poll;
                // DONE is terminal.
                _ => return,
            }
        }
    }

    /// Polls the task once. Called only by the executor that dequeued it.
    pub(crate) fn run(task: &Arc<Self>) {
        if task.scope.is_cancelled() {
            task.finish_cancelled();
            return;
        }
        task.state.store(RUNNING, Ordering::Release);

        let outcome = {
            let mut slot = task.future.lock().expect("task future lock poisoned");
            let Some(future) = slot.as_mut() else {
                // Completed through another path (e.g. cancelled after being
                // queued); nothing left to poll.
                task.state.store(DONE, Ordering::Release);
                return;
            };

            let waker = Waker::from(Arc::clone(task));
            let mut cx = Context::from_waker(&waker);
            let _scope_guard = scope::enter(&task.scope);
            match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                Ok(Poll::Pending) => None,
                Ok(Poll::Ready(())) => {
                    *slot = None;
                    Some(Ok(()))
                }
                Err(payload) => {
                    *slot = None;
                    Some(Err(payload))
                }
            }
        };

        match outcome {
            None => {
                // Pending: return to IDLE unless a wake arrived mid-poll, in
                // which case the task goes straight back on the queue. The
                // re-enqueue lands after the flush snapshot, so a frame-skip
                // resumes no earlier than the next flush.
                if task
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    debug_assert_eq!(task.state.load(Ordering::Acquire), NOTIFIED);
                    task.state.store(QUEUED, Ordering::Release);
                    task.exec.enqueue(Runnable::Task(Arc::clone(task)));
                }
            }
            Some(Ok(())) => {
                task.state.store(DONE, Ordering::Release);
            }
            Some(Err(payload)) => {
                task.state.store(DONE, Ordering::Release);
                error!(panic = %panic_message(payload.as_ref()), "task panicked");
                if task.notify_scope_on_panic {
                    task.scope.child_failed();
                }
                task.completion.panicked(payload);
            }
        }
    }

    /// Completes the task as cancelled without polling it.
    ///
    /// Drops the stored future, running destructors, so a suspended
    /// continuation unwinds instead of resuming.
    pub(crate) fn finish_cancelled(&self) {
        {
            let mut slot = self.future.lock().expect("task future lock poisoned");
            *slot = None;
        }
        self.state.store(DONE, Ordering::Release);
        self.completion.cancelled();
    }
}

impl Wake for RawTask {
    fn wake(self: Arc<Self>) {
        Self::schedule(&self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Self::schedule(self);
    }
}

/// Shared completion cell between a task and its [`JoinHandle`].
pub(crate) struct JoinSlot<T> {
    state: Mutex<SlotState<T>>,
    condvar: Condvar,
}

struct SlotState<T> {
    result: Option<Result<T, JoinError>>,
    wakers: Vec<Waker>,
}

impl<T> JoinSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                result: None,
                wakers: Vec::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Records the task's value. First completion wins.
    pub(crate) fn complete(&self, value: T) {
        self.finish(Ok(value));
    }

    fn finish(&self, result: Result<T, JoinError>) {
        let wakers = {
            let mut state = self.state.lock().expect("join slot lock poisoned");
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            std::mem::take(&mut state.wakers)
        };
        self.condvar.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T: Send> Completion for JoinSlot<T> {
    fn cancelled(&self) {
        self.finish(Err(JoinError::Cancelled));
    }

    fn panicked(&self, payload: Box<dyn Any + Send>) {
        self.finish(Err(JoinError::Panicked(PanicPayload::new(payload))));
    }
}

/// Handle to a launched task's eventual result.
///
/// Supports both blocking [`join`](JoinHandle::join) (for plain threads, e.g.
/// a test driving the render loop) and `.await` (for tasks). Dropping the
/// handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    slot: Arc<JoinSlot<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(slot: Arc<JoinSlot<T>>) -> Self {
        Self { slot }
    }

    /// Blocks the calling thread until the task completes.
    ///
    /// Must not be called from the main thread while it is also the only
    /// thread flushing the dispatcher; that would wait on work only the
    /// caller can run.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::Cancelled`] if the owning scope was cancelled
    /// before completion, or [`JoinError::Panicked`] with the preserved
    /// payload if the task panicked.
    pub fn join(self) -> Result<T, JoinError> {
        let mut state = self.slot.state.lock().expect("join slot lock poisoned");
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            state = self
                .slot
                .condvar
                .wait(state)
                .expect("join slot lock poisoned");
        }
    }

    /// Returns true once the task has completed, panicked, or been cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slot
            .state
            .lock()
            .expect("join slot lock poisoned")
            .result
            .is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock().expect("join slot lock poisoned");
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Why a joined task produced no value.
#[derive(Error)]
pub enum JoinError {
    /// The owning scope was cancelled before the task completed.
    #[error("task was cancelled")]
    Cancelled,
    /// The task panicked; the payload is preserved.
    #[error("task panicked: {0}")]
    Panicked(PanicPayload),
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Panicked(payload) => f.debug_tuple("Panicked").field(payload).finish(),
        }
    }
}

impl JoinError {
    /// Returns true for the cancellation variant.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true for the panic variant.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// Preserved payload of a panicking task.
pub struct PanicPayload(Box<dyn Any + Send>);

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        Self(payload)
    }

    /// The panic message, when the payload is a `&str` or `String`.
    #[must_use]
    pub fn message(&self) -> &str {
        panic_message(self.0.as_ref())
    }

    /// Recovers the raw payload, e.g. to re-raise it with `resume_unwind`.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.0
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}
