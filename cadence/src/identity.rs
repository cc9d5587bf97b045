//! Main-thread identity registry.
//!
//! A write-once cell holding the identity of the thread designated "main".
//! The render loop registers it at startup, either explicitly or through the
//! main dispatcher's first-flush bootstrap; every affinity check afterwards
//! is a plain comparison with no locking.

use std::sync::OnceLock;
use std::thread::{self, ThreadId};

/// Write-once registry for the designated main thread.
///
/// Each [`MainDispatcher`](crate::MainDispatcher) owns one registry, so a
/// fresh dispatcher (as constructed in tests) starts with a fresh identity.
/// The process-wide registry lives inside the global runtime.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    main: OnceLock<ThreadId>,
}

impl ThreadRegistry {
    /// Creates an empty registry with no main thread designated.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            main: OnceLock::new(),
        }
    }

    /// Registers the calling thread as the main thread.
    ///
    /// Calling again from the same thread is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if a different thread has already been registered. The main
    /// identity is immutable for the lifetime of the registry.
    pub fn register(&self) {
        let current = thread::current().id();
        let stored = *self.main.get_or_init(|| current);
        assert!(
            stored == current,
            "main thread already registered to {stored:?}, cannot re-register from {current:?}"
        );
    }

    /// Returns true if a main thread has been registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.main.get().is_some()
    }

    /// Returns the registered main thread identity, if any.
    #[must_use]
    pub fn main_thread(&self) -> Option<ThreadId> {
        self.main.get().copied()
    }

    /// Returns true if the calling thread is the registered main thread.
    ///
    /// Returns false (never errors) before registration.
    #[must_use]
    pub fn current_is_main(&self) -> bool {
        self.main.get() == Some(&thread::current().id())
    }
}
