//! Promise-bearing types that stay themselves across chaining.
//!
//! A type implementing [`Subclass`] wraps a [`Promise`] built by [`install`].
//! Every promise it derives (through `then`, `tap`, `fork`, ...) is created
//! through the type's lineage and rewrapped by [`Subclass::derive`], so
//! `Tagged<T>::then` yields a `Tagged<U>` and never a bare promise.

use crate::{
    core::{IntoResolution, Lineage, OnCancel, Options, Promise, PromiseState, Resolver},
    Error,
};

/// Builds a promise for the subclass `S` and hands it to `host`.
///
/// `cancellable: false` produces a promise that ignores `cancel`. `derived`
/// overrides the lineage chained promises are created through; by default it
/// is `S`'s own.
///
/// `derived` is a runtime tag only. The Rust type of a chained result is
/// always [`Subclass::Chained`], so with an override a `Tagged<T>` can chain
/// into a `Tagged<U>` whose [`Promise::lineage`] reports the override. Code
/// that dispatches on [`Lineage`] sees the override; the type system does not.
pub fn install<S, H, F>(host: H, executor: F, cancellable: bool, derived: Option<Lineage>) -> S
where
    S: Subclass,
    H: FnOnce(Promise<S::Value>) -> S,
    F: FnOnce(Resolver<S::Value>) -> Result<Option<OnCancel>, Error>,
{
    let lineage = S::lineage();
    let options = Options {
        lineage,
        species: derived.unwrap_or(lineage),
        cancellable,
    };
    host(Promise::construct(executor, options))
}

pub trait Subclass: Sized + 'static {
    type Value: Clone + 'static;
    type Chained<U: Clone + 'static>: Subclass<Value = U>;

    fn lineage() -> Lineage;

    fn as_promise(&self) -> &Promise<Self::Value>;

    /// Wraps a promise derived from `self`.
    fn derive<U: Clone + 'static>(&self, promise: Promise<U>) -> Self::Chained<U>;

    fn then<F, G, R, E>(&self, on_fulfilled: F, on_rejected: G) -> Self::Chained<R::Value>
    where
        F: FnOnce(Self::Value) -> R + 'static,
        G: FnOnce(Error) -> E + 'static,
        R: IntoResolution,
        E: IntoResolution<Value = R::Value>,
    {
        self.derive(self.as_promise().then(on_fulfilled, on_rejected))
    }

    fn and_then<F, R>(&self, on_fulfilled: F) -> Self::Chained<R::Value>
    where
        F: FnOnce(Self::Value) -> R + 'static,
        R: IntoResolution,
    {
        self.derive(self.as_promise().and_then(on_fulfilled))
    }

    fn map<F, U>(&self, f: F) -> Self::Chained<U>
    where
        F: FnOnce(Self::Value) -> U + 'static,
        U: Clone + 'static,
    {
        self.derive(self.as_promise().map(f))
    }

    fn otherwise<G, E>(&self, on_rejected: G) -> Self::Chained<Self::Value>
    where
        G: FnOnce(Error) -> E + 'static,
        E: IntoResolution<Value = Self::Value>,
    {
        self.derive(self.as_promise().otherwise(on_rejected))
    }

    fn ensure<F, R>(&self, f: F) -> Self::Chained<Self::Value>
    where
        F: FnOnce() -> R + 'static,
        R: IntoResolution,
    {
        self.derive(self.as_promise().ensure(f))
    }

    fn tap<F, R>(&self, f: F) -> Self::Chained<Self::Value>
    where
        F: FnOnce(&Self::Value) -> R + 'static,
        R: IntoResolution,
    {
        self.derive(self.as_promise().tap(f))
    }

    fn yield_value<U: Clone + 'static>(&self, value: U) -> Self::Chained<U> {
        self.derive(self.as_promise().yield_value(value))
    }

    fn fork(&self) -> Self::Chained<Self::Value> {
        self.derive(self.as_promise().fork())
    }

    fn uncancellable(&self) -> Self::Chained<Self::Value> {
        self.derive(self.as_promise().uncancellable())
    }

    fn cancel(&self) {
        self.as_promise().cancel();
    }

    fn inspect_state(&self) -> PromiseState<Self::Value> {
        self.as_promise().inspect_state()
    }
}

impl<T: Clone + 'static> Subclass for Promise<T> {
    type Value = T;
    type Chained<U: Clone + 'static> = Promise<U>;

    fn lineage() -> Lineage {
        Lineage::base()
    }

    fn as_promise(&self) -> &Promise<T> {
        self
    }

    fn derive<U: Clone + 'static>(&self, promise: Promise<U>) -> Promise<U> {
        promise
    }
}
