//! Cancellable single-thread promises.
//!
//! A [`Promise`] settles once, either fulfilled with a value or rejected with
//! an [`Error`]. Continuations attached with [`Promise::then`] and friends
//! always run on a later scheduler turn, in the order they were attached.
//! Cancelling a pending promise rejects it with [`Error::Cancelled`] and
//! travels upstream through the chain that feeds it.
//!
//! Work is queued on a thread-local trampoline that defers to a pluggable
//! [`Host`]. The default host is a deterministic [`EventLoop`] with a
//! virtual clock; awaiting a promise turns it.
//!
//! ```
//! use futures::executor::block_on;
//! use thenable::Promise;
//!
//! let (promise, resolver) = Promise::<i32>::pending();
//! let squared = promise.map(|n| n * n);
//! resolver.resolve(7);
//! assert_eq!(block_on(async { squared.await }).unwrap(), 49);
//! ```

pub mod combinators;
mod core;
mod error;
mod future;
pub mod hooks;
pub mod iterate;
mod propagator;
pub mod scheduler;
pub mod subclass;
mod sugar;
pub mod thenable;
mod timer;

pub use crate::core::{IntoResolution, Lineage, OnCancel, Promise, PromiseState, Resolution, Resolver};
pub use combinators::{all, all_keyed, any, denodeify, join, race, some, some_keyed, Callback, Join};
pub use error::{CancellationError, Error, Thrown, TimeoutError};
pub use future::Settled;
pub use hooks::{HandledSignal, RejectionTracker};
pub use iterate::{map_limited, map_parallel, map_series, Concurrency};
pub use scheduler::{EventLoop, Host};
pub use subclass::Subclass;
pub use thenable::{Thenable, ThenableResolver};
pub use timer::{delay, timeout};
