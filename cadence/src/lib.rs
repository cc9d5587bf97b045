//! Frame-synchronized task scheduler.
//!
//! cadence pairs an externally driven render loop with asynchronous work
//! that must run either on the loop's own thread (the designated "main"
//! thread) or on auxiliary worker pools.
//!
//! # Architecture
//!
//! - The **main dispatcher** owns a FIFO drained once per tick by
//!   [`MainDispatcher::flush`], called by the render loop from the thread it
//!   wants designated main. Execution is strictly single-threaded and
//!   cooperative: tasks interleave only at explicit suspension points.
//! - [`skip_tick`] suspends the calling task until a subsequent flush,
//!   guaranteeing the tick counter advanced before it resumes.
//! - **Worker pools** ([`WorkerPool`]) run work genuinely in parallel;
//!   [`switch_to`] hops a task between dispatchers and back without leaking
//!   thread identity.
//! - **Scopes** ([`Scope`]) group tasks under a shared cancellation
//!   lifecycle. The [`global_scope`] lives for the process; [`local_scope`]
//!   trees cancel independently of it.
//!
//! # Example
//!
//! ```
//! use cadence::{MainDispatcher, Scope, skip_tick};
//!
//! let main = MainDispatcher::new();
//! let scope = Scope::local(main.dispatcher());
//!
//! let ticks = main.clone();
//! let handle = scope.launch(async move {
//!     let seen = ticks.ticks();
//!     skip_tick().await; // resume next frame
//!     assert_eq!(ticks.ticks(), seen + 1);
//!     "frame advanced"
//! });
//!
//! // The render loop's job: one flush per tick.
//! main.flush();
//! main.flush();
//! assert_eq!(handle.join().unwrap(), "frame advanced");
//! ```
//!
//! # Tracing
//!
//! Enable the `tracing` feature and call [`init_tracing`] to see dispatcher
//! lifecycle and per-flush diagnostics.

pub mod dispatch;
pub mod identity;
pub mod runtime;
pub mod scope;
pub mod task;
pub mod topology;

mod trace;

#[doc(inline)]
pub use dispatch::{
    Dispatcher, MainDispatcher, PoolError, SkipTick, WorkerPool, WorkerPoolConfig, skip_tick,
    switch_to,
};
#[doc(inline)]
pub use runtime::{
    current_is_main, global_scope, launch, local_scope, main_dispatcher, new_single_thread_pool,
    new_thread_pool, submit_to_main, with_main_thread,
};
#[doc(inline)]
pub use scope::Scope;
#[doc(inline)]
pub use task::{JoinError, JoinHandle, PanicPayload};

pub use trace::init_tracing;
