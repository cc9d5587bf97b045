//! Cancellable scopes: structured grouping of tasks.
//!
//! A scope is a node in a tree. Cancellation walks down only: cancelling a
//! scope cancels its tasks and descendant scopes, never its parent or
//! siblings. That is what keeps locally created scopes independent from
//! the process-wide global scope.
//!
//! Tasks launched in a scope inherit its cancellation: a not-yet-started
//! task is skipped at drain time, and a suspended task is woken so its
//! continuation is dropped (unwound) instead of resumed.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::dispatch::Dispatcher;
use crate::task::{Completion, JoinHandle, JoinSlot, RawTask};
use crate::trace::{debug, warn};

/// Distinguishes the process-wide root from cancellable local scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    /// The global scope: lives for the process, ignores `cancel()`.
    Root,
    /// An application-created scope: independently cancellable.
    Local,
}

pub(crate) struct ScopeInner {
    kind: ScopeKind,
    cancelled: AtomicBool,
    /// Non-owning backlink, kept for diagnostics; cancellation never walks up.
    parent: Weak<ScopeInner>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
    tasks: Mutex<Vec<Weak<RawTask>>>,
    default_dispatcher: Dispatcher,
}

impl ScopeInner {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Marks this scope and every descendant cancelled, then wakes all
    /// registered tasks so their executors reap them.
    fn cancel_tree(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("scope cancelled");

        let children: Vec<Arc<ScopeInner>> = {
            let children = self.children.lock().expect("scope children lock poisoned");
            children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.cancel_tree();
        }

        let tasks: Vec<Arc<RawTask>> = {
            let tasks = self.tasks.lock().expect("scope task lock poisoned");
            tasks.iter().filter_map(Weak::upgrade).collect()
        };
        for task in tasks {
            // The executor's pre-poll check sees the flag and drops the
            // task's continuation instead of polling it.
            RawTask::schedule(&task);
        }
    }

    /// Failure policy: a panicking child cancels the rest of a local scope;
    /// the root scope contains the failure to the failing task.
    pub(crate) fn child_failed(&self) {
        if self.kind == ScopeKind::Local {
            self.cancel_tree();
        }
    }

    fn register_child(&self, child: &Arc<ScopeInner>) {
        let mut children = self.children.lock().expect("scope children lock poisoned");
        if children.len() == children.capacity() {
            children.retain(|weak| weak.strong_count() > 0);
        }
        children.push(Arc::downgrade(child));
    }

    fn register_task(&self, task: &Arc<RawTask>) {
        let mut tasks = self.tasks.lock().expect("scope task lock poisoned");
        // Compact dead entries before the vec grows.
        if tasks.len() == tasks.capacity() {
            tasks.retain(|weak| weak.strong_count() > 0);
        }
        tasks.push(Arc::downgrade(task));
    }
}

/// A cancellable grouping of tasks sharing a failure/cancellation lifecycle.
///
/// Cheap to clone; clones share the same underlying node.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    fn with_kind(kind: ScopeKind, parent: Weak<ScopeInner>, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                kind,
                cancelled: AtomicBool::new(false),
                parent,
                children: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                default_dispatcher: dispatcher,
            }),
        }
    }

    /// Creates the process-root scope. Crate-internal: applications obtain
    /// it through [`global_scope`](crate::global_scope).
    pub(crate) fn root(dispatcher: Dispatcher) -> Self {
        Self::with_kind(ScopeKind::Root, Weak::new(), dispatcher)
    }

    /// Creates an independent cancellable scope bound to `dispatcher` by
    /// default.
    ///
    /// The new scope is a root of its own tree: cancelling it never affects
    /// the global scope or any other scope, and vice versa.
    #[must_use]
    pub fn local(dispatcher: Dispatcher) -> Self {
        Self::with_kind(ScopeKind::Local, Weak::new(), dispatcher)
    }

    /// Creates a cancellable child scope.
    ///
    /// The child inherits this scope's default dispatcher and is cancelled
    /// when this scope is cancelled; cancelling the child leaves this scope
    /// untouched. A child of an already-cancelled scope is born cancelled.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::with_kind(
            ScopeKind::Local,
            Arc::downgrade(&self.inner),
            self.inner.default_dispatcher.clone(),
        );
        if self.inner.is_cancelled() {
            child.inner.cancelled.store(true, Ordering::Release);
        } else {
            self.inner.register_child(&child.inner);
        }
        child
    }

    /// Schedules `future` under this scope on the scope's default dispatcher.
    pub fn launch<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let dispatcher = self.inner.default_dispatcher.clone();
        self.launch_on(&dispatcher, future)
    }

    /// Schedules `future` under this scope on an explicit dispatcher.
    ///
    /// If the scope is already cancelled the task never runs and the handle
    /// resolves to [`JoinError::Cancelled`](crate::JoinError::Cancelled)
    /// immediately.
    pub fn launch_on<F, T>(&self, dispatcher: &Dispatcher, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.launch_inner(dispatcher, future, true)
    }

    /// Launches a continuation sub-task for a dispatcher switch. Its panic
    /// does not fail the scope directly; the payload relays through the
    /// handle to the awaiting task, which re-raises it in its own poll.
    pub(crate) fn launch_continuation_on<F, T>(
        &self,
        dispatcher: &Dispatcher,
        future: F,
    ) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.launch_inner(dispatcher, future, false)
    }

    fn launch_inner<F, T>(
        &self,
        dispatcher: &Dispatcher,
        future: F,
        notify_scope_on_panic: bool,
    ) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(JoinSlot::new());
        let wrapped = {
            let slot = Arc::clone(&slot);
            async move {
                let value = future.await;
                slot.complete(value);
            }
        };
        let task = RawTask::new(
            wrapped,
            Arc::clone(&slot) as Arc<dyn Completion>,
            Arc::clone(&self.inner),
            dispatcher.exec_ref().clone(),
            notify_scope_on_panic,
        );
        self.inner.register_task(&task);
        if self.inner.is_cancelled() {
            task.finish_cancelled();
        } else {
            RawTask::schedule(&task);
        }
        JoinHandle::new(slot)
    }

    /// Cancels this scope: queued tasks are skipped, suspended tasks are
    /// woken to unwind, descendant scopes are cancelled. Sibling scopes and
    /// the global scope are unaffected.
    ///
    /// On the global scope this is ignored with a warning; its lifecycle is
    /// reserved for process teardown.
    pub fn cancel(&self) {
        match self.inner.kind {
            ScopeKind::Root => warn!("cancel() on the global scope is ignored"),
            ScopeKind::Local => self.inner.cancel_tree(),
        }
    }

    /// Returns true once this scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// The dispatcher tasks run on when [`launch`](Scope::launch) is used.
    #[must_use]
    pub fn default_dispatcher(&self) -> &Dispatcher {
        &self.inner.default_dispatcher
    }

    /// Returns true if this scope has a living parent scope.
    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.inner.parent.strong_count() > 0
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("kind", &self.inner.kind)
            .field("cancelled", &self.is_cancelled())
            .field("dispatcher", &self.inner.default_dispatcher.name())
            .finish()
    }
}

thread_local! {
    static CURRENT_SCOPE: RefCell<Option<Arc<ScopeInner>>> = const { RefCell::new(None) };
}

/// Marks `scope` as the scope of the task being polled on this thread.
pub(crate) fn enter(scope: &Arc<ScopeInner>) -> EnterGuard {
    let prev = CURRENT_SCOPE.with(|current| current.replace(Some(Arc::clone(scope))));
    EnterGuard { prev }
}

pub(crate) struct EnterGuard {
    prev: Option<Arc<ScopeInner>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT_SCOPE.with(|current| {
            *current.borrow_mut() = self.prev.take();
        });
    }
}

/// The scope of the task currently being polled on this thread, if any.
///
/// Only set while a dispatcher is polling a task; plain threads and
/// fire-and-forget closures see `None`.
#[must_use]
pub fn current() -> Option<Scope> {
    CURRENT_SCOPE.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|inner| Scope {
                inner: Arc::clone(inner),
            })
    })
}
