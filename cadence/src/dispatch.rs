//! Execution contexts: the tick-bound main dispatcher and worker pools.
//!
//! # Architecture
//!
//! Two dispatcher variants exist:
//!
//! - **Main**: a singleton per render loop, thread-affine. Work is pushed
//!   from any thread into a FIFO and drained synchronously, in order, by
//!   [`MainDispatcher::flush`], which the render loop calls exactly once per
//!   tick from the thread designated "main". Tasks interleave only at
//!   explicit suspension points (frame skip, dispatcher switch, join), never
//!   preemptively.
//! - **WorkerPool**: a fixed set of long-lived worker threads draining a
//!   shared injector continuously and concurrently. No ordering guarantee
//!   across workers; order is preserved only among entries that happen to
//!   run on the same worker.
//!
//! A task running under either dispatcher can hop to the other for a
//! sub-block with [`switch_to`] and resume where it was; thread-identity
//! checks always report the thread actually executing, at any nesting depth.

mod main;
mod pool;

use std::future::Future;
use std::panic;
use std::sync::Arc;

use crate::task::{JoinError, Runnable};

pub use main::{MainDispatcher, SkipTick, skip_tick};
pub use pool::{PoolError, WorkerPool, WorkerPoolConfig};

pub(crate) use main::MainShared;
pub(crate) use pool::PoolShared;

/// Internal reference to a dispatcher's shared state, used by tasks to
/// re-enqueue themselves on wake.
#[derive(Clone)]
pub(crate) enum ExecutorRef {
    Main(Arc<MainShared>),
    Pool(Arc<PoolShared>),
}

impl ExecutorRef {
    pub(crate) fn enqueue(&self, runnable: Runnable) {
        match self {
            Self::Main(shared) => shared.enqueue(runnable),
            Self::Pool(shared) => shared.enqueue(runnable),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Main(_) => "main",
            Self::Pool(shared) => shared.name(),
        }
    }
}

/// A named execution context deciding which thread(s) run submitted work.
///
/// Cheap to clone; obtained from [`MainDispatcher::dispatcher`] or
/// [`WorkerPool::dispatcher`].
#[derive(Clone)]
pub struct Dispatcher {
    inner: ExecutorRef,
}

impl Dispatcher {
    pub(crate) fn new(inner: ExecutorRef) -> Self {
        Self { inner }
    }

    pub(crate) fn exec_ref(&self) -> &ExecutorRef {
        &self.inner
    }

    /// Returns true for a main (tick-bound, thread-affine) dispatcher.
    #[must_use]
    pub fn is_main(&self) -> bool {
        matches!(self.inner, ExecutorRef::Main(_))
    }

    /// The dispatcher's name: `"main"`, or the worker pool's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Dispatcher").field(&self.name()).finish()
    }
}

/// Runs `future` to completion on `dispatcher`, then resumes the caller
/// where it was.
///
/// The sub-block is launched under the calling task's scope, so structured
/// cancellation flows through the switch: cancelling the scope cancels both
/// sides. Inside the sub-block, identity checks report the thread actually
/// executing: `current_is_main()` is false for the duration of a switch
/// into a worker pool and true again after resumption, at any nesting depth.
///
/// A panic inside the sub-block is re-raised in the calling task.
pub async fn switch_to<F, T>(dispatcher: &Dispatcher, future: F) -> T
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let scope =
        crate::scope::current().unwrap_or_else(|| crate::runtime::global_scope().clone());
    let handle = scope.launch_continuation_on(dispatcher, future);
    match handle.await {
        Ok(value) => value,
        Err(JoinError::Panicked(payload)) => panic::resume_unwind(payload.into_inner()),
        Err(JoinError::Cancelled) if scope.is_cancelled() => {
            // The sub-task shares our scope, so our own scope is cancelled
            // too; park until the executor reaps this task.
            std::future::pending().await
        }
        Err(JoinError::Cancelled) => {
            panic!(
                "dispatcher '{}' rejected the switch: it has shut down",
                dispatcher.name()
            )
        }
    }
}
