//! Assimilation of foreign promise-like values.
//!
//! A [`Thenable`] is anything that can hand over a `then` capability. When a
//! promise is resolved with one, the capability is looked up exactly once and
//! invoked with a single-use [`ThenableResolver`].

use std::{cell::Cell, fmt, rc::Rc};

use crate::{
    core::{Core, IntoResolution, Resolution},
    scheduler, Error,
};

/// What probing a thenable turned up.
pub enum Probe<T> {
    /// A `then` capability to invoke.
    Then(ThenFn<T>),
    /// The value is not promise-like after all and is used as is.
    Value(T),
}

pub type ThenFn<T> = Box<dyn FnOnce(ThenableResolver<T>) -> Result<(), Error>>;

/// A value that may expose a `then` capability.
pub trait Thenable<T> {
    /// Looks up the capability. An error here rejects the adopting promise.
    fn probe(self: Box<Self>) -> Result<Probe<T>, Error>;
}

/// Wraps a closure acting as the `then` capability.
///
/// # Examples
///
/// ```
/// use ::thenable::{thenable, Promise, Resolution};
///
/// let promise = Promise::resolved(Resolution::thenable(thenable::from_fn(|resolver| {
///     resolver.resolve(42);
///     Ok(())
/// })));
/// assert_eq!(promise.inspect_state().value(), Some(&42));
/// ```
pub fn from_fn<T, F>(then: F) -> FnThenable<F>
where
    F: FnOnce(ThenableResolver<T>) -> Result<(), Error> + 'static,
{
    FnThenable(then)
}

pub struct FnThenable<F>(F);

impl<T, F> Thenable<T> for FnThenable<F>
where
    F: FnOnce(ThenableResolver<T>) -> Result<(), Error> + 'static,
{
    fn probe(self: Box<Self>) -> Result<Probe<T>, Error> {
        Ok(Probe::Then(Box::new(self.0)))
    }
}

/// Single-use resolve/reject pair handed to a thenable's `then`.
///
/// Whichever method is called first wins. Calls after that, or after the
/// adopting promise was cancelled, are ignored.
pub struct ThenableResolver<T> {
    core: Rc<Core<T>>,
    gate: Rc<Cell<bool>>,
}

impl<T> Clone for ThenableResolver<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            gate: Rc::clone(&self.gate),
        }
    }
}

impl<T> fmt::Debug for ThenableResolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThenableResolver")
            .field("closed", &self.gate.get())
            .finish()
    }
}

impl<T: Clone + 'static> ThenableResolver<T> {
    pub fn resolve(&self, value: T) {
        self.resolve_with(Resolution::Value(value));
    }

    pub fn resolve_with(&self, value: impl IntoResolution<Value = T>) {
        if self.gate.replace(true) {
            return;
        }
        self.core.adopt(value.into_resolution());
    }

    pub fn reject(&self, reason: Error) {
        self.resolve_with(Resolution::Rejected(reason));
    }
}

pub(crate) fn assimilate<T: Clone + 'static>(core: &Rc<Core<T>>, thenable: Box<dyn Thenable<T>>) {
    let then = match thenable.probe() {
        Ok(Probe::Then(then)) => then,
        Ok(Probe::Value(value)) => return core.adopt(Resolution::Value(value)),
        Err(reason) => return core.adopt(Resolution::Rejected(reason)),
    };
    let gate = Rc::new(Cell::new(false));
    core.forward_cancel({
        let gate = Rc::clone(&gate);
        Box::new(move || gate.set(true))
    });
    let resolver = ThenableResolver {
        core: Rc::clone(core),
        gate,
    };
    scheduler::same_turn_one(Box::new(move || {
        if resolver.gate.get() {
            return;
        }
        if let Err(reason) = then(resolver.clone()) {
            resolver.reject(reason);
        }
    }));
}
