//! The process-global runtime: one main dispatcher, one global scope.
//!
//! Lazily initialized on first use. The render loop drives it by calling
//! [`main_dispatcher`]`().flush()` once per tick from the thread it wants
//! designated "main"; everything else in the crate-level API delegates here.

use std::future::Future;
use std::sync::OnceLock;

use crate::dispatch::{MainDispatcher, PoolError, WorkerPool};
use crate::scope::{self, Scope};
use crate::task::JoinHandle;
use crate::trace::debug;

struct Runtime {
    main: MainDispatcher,
    global: Scope,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let main = MainDispatcher::new();
        let global = Scope::root(main.dispatcher());
        debug!("global runtime initialized");
        Runtime { main, global }
    })
}

/// The process-wide main dispatcher.
///
/// The render loop calls `main_dispatcher().flush()` once per tick; the
/// first flush designates its calling thread as main.
#[must_use]
pub fn main_dispatcher() -> &'static MainDispatcher {
    &runtime().main
}

/// The process-wide scope, bound to the main dispatcher.
///
/// Never cancellable by application code; its lifecycle is the process
/// lifecycle.
#[must_use]
pub fn global_scope() -> &'static Scope {
    &runtime().global
}

/// Creates an independent cancellable scope bound to the main dispatcher.
///
/// Cancelling it never affects the global scope or any other local scope.
#[must_use]
pub fn local_scope() -> Scope {
    Scope::local(main_dispatcher().dispatcher())
}

/// Returns true if the calling thread is the registered main thread.
///
/// Returns false before the render loop has registered one. Inside a
/// dispatcher switch this reports the thread actually executing, at any
/// nesting depth.
#[must_use]
pub fn current_is_main() -> bool {
    main_dispatcher().on_main_thread()
}

/// Enqueues a fire-and-forget closure onto the main dispatcher.
pub fn submit_to_main(f: impl FnOnce() + Send + 'static) {
    main_dispatcher().submit(f);
}

/// Runs `f` on the main thread and returns its result, blocking the caller
/// until the block has run. Runs inline when already on the main thread.
pub fn with_main_thread<R, F>(f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    main_dispatcher().with_main(f)
}

/// Schedules `future` under the calling task's scope (or the global scope
/// when called outside a task), on the scope's default dispatcher.
pub fn launch<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match scope::current() {
        Some(scope) => scope.launch(future),
        None => global_scope().launch(future),
    }
}

/// Creates a worker pool with `threads` workers.
///
/// # Errors
///
/// Returns [`PoolError::InvalidThreadCount`] if `threads` is zero.
pub fn new_thread_pool(threads: usize) -> Result<WorkerPool, PoolError> {
    WorkerPool::new(threads)
}

/// Creates a single-threaded worker pool.
#[must_use]
pub fn new_single_thread_pool() -> WorkerPool {
    WorkerPool::single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_constructors_apply_the_configured_size() {
        let pool = new_thread_pool(4).unwrap();
        assert_eq!(pool.thread_count(), 4);
        pool.shutdown();

        let single = new_single_thread_pool();
        assert_eq!(single.thread_count(), 1);
        single.shutdown();

        assert!(new_thread_pool(0).is_err());
    }

    #[test]
    fn local_scopes_are_independent_of_the_global_scope() {
        let local = local_scope();
        local.cancel();

        assert!(local.is_cancelled());
        assert!(!global_scope().is_cancelled());

        // And the global scope shrugs off cancellation attempts entirely.
        global_scope().cancel();
        assert!(!global_scope().is_cancelled());
    }
}
