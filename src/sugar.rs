//! Convenience transforms over [`Promise`].

use std::{cell::Cell, rc::Rc};

use crate::{
    core::{IntoResolution, Options, Promise, Resolution, Waiter},
    subclass::{install, Subclass},
    Error,
};

impl<T: Clone + 'static> Promise<T> {
    /// Replaces the fulfillment value.
    pub fn yield_value<U: Clone + 'static>(&self, value: U) -> Promise<U> {
        self.map(move |_| value)
    }

    /// Runs `f` once the promise settles either way, then settles like
    /// `self`. If `f` fails (or returns a promise that rejects) the result
    /// rejects with that reason instead.
    pub fn ensure<F, R>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() -> R + 'static,
        R: IntoResolution,
    {
        let on_fulfilled = Rc::new(Cell::new(Some(f)));
        let on_rejected = Rc::clone(&on_fulfilled);
        self.then(
            move |value| finally(&on_fulfilled, Ok(value)),
            move |reason| finally(&on_rejected, Err(reason)),
        )
    }

    /// Runs `f` on the fulfillment value and passes the value on, waiting
    /// for whatever `f` returns first.
    pub fn tap<F, R>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(&T) -> R + 'static,
        R: IntoResolution,
    {
        self.and_then(move |value| match f(&value).into_resolution() {
            Resolution::Value(_) => Resolution::Value(value),
            Resolution::Rejected(reason) => Resolution::Rejected(reason),
            pending => Resolution::Promise(Promise::resolved(pending).yield_value(value)),
        })
    }

    /// A promise settling like `self` whose cancellation stays local.
    pub fn fork(&self) -> Promise<T> {
        self.mirror(Options::derived_from(self))
    }

    /// A promise settling like `self` that ignores `cancel`.
    pub fn uncancellable(&self) -> Promise<T> {
        self.mirror(Options {
            cancellable: false,
            ..Options::derived_from(self)
        })
    }

    /// Converts into another promise-bearing type. The result follows
    /// `self`, cancellation included.
    pub fn to<S, H>(&self, host: H) -> S
    where
        S: Subclass<Value = T>,
        H: FnOnce(Promise<T>) -> S,
    {
        let source = self.clone();
        install(
            host,
            move |resolver| {
                resolver.resolve_with(source);
                Ok(None)
            },
            true,
            None,
        )
    }

    fn mirror(&self, options: Options) -> Promise<T> {
        let source = self.clone();
        Promise::construct(
            move |resolver| {
                source.subscribe(Waiter::internal(move |outcome| resolver.forward(outcome)));
                Ok(None)
            },
            options,
        )
    }
}

fn finally<F, R, T>(callback: &Cell<Option<F>>, settled: Result<T, Error>) -> Resolution<T>
where
    F: FnOnce() -> R,
    R: IntoResolution,
    T: Clone + 'static,
{
    let Some(f) = callback.take() else {
        return settled.into_resolution();
    };
    match f().into_resolution() {
        Resolution::Value(_) => settled.into_resolution(),
        Resolution::Rejected(reason) => Resolution::Rejected(reason),
        pending => Resolution::Promise(
            Promise::resolved(pending).then(move |_| settled, |reason| Err::<T, Error>(reason)),
        ),
    }
}

macro_rules! impl_spread {
    ($($name:ident),+) => {
        impl<$($name: Clone + 'static),+> Promise<($($name,)+)> {
            /// Calls `f` with the fulfilled tuple's elements as arguments.
            #[allow(non_snake_case)]
            pub fn spread<F, R>(&self, f: F) -> Promise<R::Value>
            where
                F: FnOnce($($name),+) -> R + 'static,
                R: IntoResolution,
            {
                self.and_then(move |($($name,)+)| f($($name),+))
            }
        }
    };
}

impl_spread!(A, B);
impl_spread!(A, B, C);
impl_spread!(A, B, C, D);
