//! Lazily materialized promises produced by chaining.
//!
//! `then` does not allocate a settlement core. The derived promise is a
//! [`Propagator`] that runs its transform when the parent settles and only
//! builds a delegate core (through the parent's species) once something
//! subscribes to it while it is still unsettled.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use crate::{
    core::{
        dispatch, Core, IntoResolution, Lineage, Node, OnCancel, Options, Outcome, Promise,
        Rejection, Resolution, Waiter,
    },
    scheduler::{self, Task},
    Error,
};

type OnFulfilled<P, T> = Box<dyn FnOnce(P) -> Resolution<T>>;
type OnRejected<T> = Box<dyn FnOnce(Error) -> Resolution<T>>;

pub(crate) struct Transforms<P, T> {
    on_fulfilled: OnFulfilled<P, T>,
    on_rejected: Option<OnRejected<T>>,
}

enum Settlement<T> {
    Resolve(Resolution<T>),
    /// Parent rejection passed through untouched, handled signal included.
    Forward(Rejection),
}

impl<P, T> Transforms<P, T> {
    fn apply(self, outcome: Outcome<P>) -> Settlement<T> {
        match outcome {
            Outcome::Fulfilled(value) => Settlement::Resolve((self.on_fulfilled)(value)),
            Outcome::Rejected(rejection) => match self.on_rejected {
                Some(on_rejected) => Settlement::Resolve(on_rejected(rejection.handle())),
                None => Settlement::Forward(rejection),
            },
        }
    }
}

enum Stage<T> {
    Initialized,
    Delegated(Rc<Core<T>>),
    /// The transform produced a promise or thenable nobody has asked for yet.
    PendingOnThenable(Resolution<T>),
    Fulfilled(T),
    Rejected(Rejection),
}

impl<T: Clone> Stage<T> {
    fn outcome(&self) -> Option<Outcome<T>> {
        match self {
            Stage::Fulfilled(value) => Some(Outcome::Fulfilled(value.clone())),
            Stage::Rejected(rejection) => Some(Outcome::Rejected(rejection.clone())),
            _ => None,
        }
    }
}

pub(crate) struct Propagator<P, T> {
    /// Held until the transform fires, so cancellation can always reach it.
    parent: RefCell<Option<Rc<dyn Node<P>>>>,
    transforms: RefCell<Option<Transforms<P, T>>>,
    stage: RefCell<Stage<T>>,
    cancel_requested: Rc<Cell<bool>>,
    species: Lineage,
}

impl<P: Clone + 'static, T: Clone + 'static> Propagator<P, T> {
    pub(crate) fn chain(parent: &Promise<P>, transforms: Transforms<P, T>) -> Promise<T> {
        let propagator = Rc::new(Propagator {
            parent: RefCell::new(Some(Rc::clone(&parent.node))),
            transforms: RefCell::new(Some(transforms)),
            stage: RefCell::new(Stage::Initialized),
            cancel_requested: Rc::default(),
            species: parent.node.species(),
        });
        let waiting = Rc::clone(&propagator);
        parent.subscribe(Waiter::external(move |outcome| waiting.run(outcome)));
        Promise { node: propagator }
    }

    fn run(&self, outcome: Outcome<P>) {
        self.parent.take();
        let transforms = self.transforms.borrow_mut().take();
        let Some(transforms) = transforms else {
            return;
        };
        let settlement = if self.cancel_requested.get() {
            if let Outcome::Rejected(rejection) = outcome {
                rejection.handle();
            }
            Settlement::Resolve(Resolution::Rejected(Error::cancelled()))
        } else {
            match transforms.apply(outcome) {
                // Cancelled while the transform ran: its result is dropped.
                settlement if self.cancel_requested.get() => {
                    abandon(settlement);
                    Settlement::Resolve(Resolution::Rejected(Error::cancelled()))
                }
                settlement => settlement,
            }
        };
        self.complete(settlement);
    }

    fn complete(&self, settlement: Settlement<T>) {
        let settlement = match settlement {
            Settlement::Resolve(Resolution::Promise(promise)) if promise.is_node(self as *const Self) => {
                Settlement::Resolve(Resolution::Rejected(Error::type_mismatch(
                    "a chained promise cannot resolve to itself",
                )))
            }
            settlement => settlement,
        };
        let delegate = match &*self.stage.borrow() {
            Stage::Delegated(core) => Some(Rc::clone(core)),
            _ => None,
        };
        if let Some(core) = delegate {
            match settlement {
                Settlement::Resolve(resolution) => core.resolve_with(resolution),
                Settlement::Forward(rejection) => core.forward(Outcome::Rejected(rejection)),
            }
            return;
        }
        let next = match settlement {
            Settlement::Forward(rejection) => Stage::Rejected(rejection),
            Settlement::Resolve(Resolution::Value(value)) => Stage::Fulfilled(value),
            Settlement::Resolve(Resolution::Rejected(reason)) => {
                Stage::Rejected(Rejection::report(reason))
            }
            Settlement::Resolve(Resolution::Promise(promise)) => match promise.node.outcome() {
                Some(Outcome::Fulfilled(value)) => Stage::Fulfilled(value),
                Some(Outcome::Rejected(rejection)) => Stage::Rejected(rejection),
                None => Stage::PendingOnThenable(Resolution::Promise(promise)),
            },
            Settlement::Resolve(thenable @ Resolution::Thenable(_)) => {
                Stage::PendingOnThenable(thenable)
            }
        };
        *self.stage.borrow_mut() = next;
    }

    /// Builds the delegate core through the species this promise was
    /// chained from.
    fn delegate(self: &Rc<Self>) -> Rc<Core<T>> {
        let propagator = Rc::downgrade(self);
        let options = Options {
            lineage: self.species,
            species: self.species,
            cancellable: true,
        };
        Core::construct(
            move |_| {
                let on_cancel: OnCancel = Box::new(move || {
                    if let Some(propagator) = propagator.upgrade() {
                        propagator.cancel_upstream();
                    }
                });
                Ok(Some(on_cancel))
            },
            options,
        )
    }

    /// Cancels the parent if it is still pending. Otherwise the transform
    /// either has not run yet or is running now, and its result is masked.
    ///
    /// The parent is cancelled from a same-turn frame, so a long pending
    /// chain is walked without growing the stack.
    fn cancel_upstream(&self) {
        let parent = self.parent.borrow().clone();
        let Some(parent) = parent.filter(|parent| parent.is_pending()) else {
            self.cancel_requested.set(true);
            return;
        };
        let target = Rc::clone(&parent);
        let requested = Rc::clone(&self.cancel_requested);
        scheduler::same_turn(VecDeque::from([
            Box::new(move || target.cancel()) as Task,
            // Runs once the cancel above has been fully walked upstream.
            Box::new(move || {
                if parent.is_pending() {
                    requested.set(true);
                }
            }),
        ]));
    }
}

/// Drops a transform result that lost to cancellation.
fn abandon<T: Clone + 'static>(settlement: Settlement<T>) {
    match settlement {
        Settlement::Resolve(Resolution::Promise(promise)) => promise.cancel(),
        Settlement::Forward(rejection) => {
            rejection.handle();
        }
        _ => {}
    }
}

impl<P: Clone + 'static, T: Clone + 'static> Node<T> for Propagator<P, T> {
    fn register(self: Rc<Self>, waiter: Waiter<T>) {
        let mut stage = self.stage.borrow_mut();
        if let Some(outcome) = stage.outcome() {
            drop(stage);
            dispatch(vec![waiter], outcome);
            return;
        }
        let (core, nested) = match std::mem::replace(&mut *stage, Stage::Initialized) {
            Stage::Delegated(core) => (core, None),
            Stage::PendingOnThenable(nested) => (self.delegate(), Some(nested)),
            _ => (self.delegate(), None),
        };
        *stage = Stage::Delegated(Rc::clone(&core));
        drop(stage);
        if let Some(nested) = nested {
            core.resolve_with(nested);
        }
        core.register(waiter);
    }

    fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.stage.borrow() {
            Stage::Delegated(core) => core.outcome(),
            stage => stage.outcome(),
        }
    }

    fn is_pending(&self) -> bool {
        match &*self.stage.borrow() {
            Stage::Delegated(core) => core.is_pending(),
            Stage::Fulfilled(_) | Stage::Rejected(_) => false,
            Stage::Initialized | Stage::PendingOnThenable(_) => true,
        }
    }

    fn cancel(&self) {
        let stage = std::mem::replace(&mut *self.stage.borrow_mut(), Stage::Initialized);
        match stage {
            Stage::Initialized => self.cancel_upstream(),
            Stage::Delegated(core) => {
                *self.stage.borrow_mut() = Stage::Delegated(Rc::clone(&core));
                core.cancel();
            }
            Stage::PendingOnThenable(nested) => {
                tracing::debug!(lineage = self.species.name(), "cancelling unobserved chained promise");
                *self.stage.borrow_mut() = Stage::Rejected(Rejection::report(Error::cancelled()));
                if let Resolution::Promise(promise) = nested {
                    promise.cancel();
                }
            }
            settled => *self.stage.borrow_mut() = settled,
        }
    }

    fn cancellable(&self) -> bool {
        true
    }

    fn lineage(&self) -> Lineage {
        match &*self.stage.borrow() {
            Stage::Delegated(core) => core.lineage(),
            _ => self.species,
        }
    }

    fn species(&self) -> Lineage {
        match &*self.stage.borrow() {
            Stage::Delegated(core) => core.species(),
            _ => self.species,
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Chains both a fulfillment and a rejection transform.
    ///
    /// Transforms run on a later turn than the one that settled `self`, in
    /// the order they were attached. Returning `Err` rejects the derived
    /// promise; returning a promise or thenable makes it follow that value.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::executor::block_on;
    /// use thenable::{Error, Promise};
    ///
    /// let promise = Promise::<u32>::rejected(Error::thrown("offline"))
    ///     .then(|n| Ok::<_, Error>(n * 2), |_| Ok::<_, Error>(0));
    /// assert_eq!(block_on(async { promise.await }).unwrap(), 0);
    /// ```
    pub fn then<F, G, R, E>(&self, on_fulfilled: F, on_rejected: G) -> Promise<R::Value>
    where
        F: FnOnce(T) -> R + 'static,
        G: FnOnce(Error) -> E + 'static,
        R: IntoResolution,
        E: IntoResolution<Value = R::Value>,
    {
        Propagator::chain(
            self,
            Transforms {
                on_fulfilled: Box::new(move |value| on_fulfilled(value).into_resolution()),
                on_rejected: Some(Box::new(move |reason| on_rejected(reason).into_resolution())),
            },
        )
    }

    /// Like [`then`](Promise::then) with either transform optional. Missing
    /// transforms pass the settlement through; with neither given the
    /// promise itself is returned.
    pub fn then_opt<F, G, R, E>(&self, on_fulfilled: Option<F>, on_rejected: Option<G>) -> Promise<T>
    where
        F: FnOnce(T) -> R + 'static,
        G: FnOnce(Error) -> E + 'static,
        R: IntoResolution<Value = T>,
        E: IntoResolution<Value = T>,
    {
        if on_fulfilled.is_none() && on_rejected.is_none() {
            return self.clone();
        }
        let on_fulfilled: OnFulfilled<T, T> = match on_fulfilled {
            Some(f) => Box::new(move |value| f(value).into_resolution()),
            None => Box::new(Resolution::Value),
        };
        let on_rejected = on_rejected
            .map(|g| Box::new(move |reason: Error| g(reason).into_resolution()) as OnRejected<T>);
        Propagator::chain(
            self,
            Transforms {
                on_fulfilled,
                on_rejected,
            },
        )
    }

    /// Chains a fulfillment transform; rejections pass through.
    pub fn and_then<F, R>(&self, on_fulfilled: F) -> Promise<R::Value>
    where
        F: FnOnce(T) -> R + 'static,
        R: IntoResolution,
    {
        Propagator::chain(
            self,
            Transforms {
                on_fulfilled: Box::new(move |value| on_fulfilled(value).into_resolution()),
                on_rejected: None,
            },
        )
    }

    pub fn map<F, U>(&self, f: F) -> Promise<U>
    where
        F: FnOnce(T) -> U + 'static,
        U: Clone + 'static,
    {
        self.and_then(move |value| Resolution::Value(f(value)))
    }

    /// Chains a rejection transform; fulfillments pass through.
    pub fn otherwise<G, E>(&self, on_rejected: G) -> Promise<T>
    where
        G: FnOnce(Error) -> E + 'static,
        E: IntoResolution<Value = T>,
    {
        Propagator::chain(
            self,
            Transforms {
                on_fulfilled: Box::new(Resolution::Value),
                on_rejected: Some(Box::new(move |reason| on_rejected(reason).into_resolution())),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        scheduler::run_until_idle,
        thenable::{from_fn, ThenableResolver},
    };

    #[test]
    fn test_transform_runs_on_later_turn() {
        let promise = Promise::fulfilled(2).map(|n| n + 1);
        assert!(promise.inspect_state().is_pending());
        run_until_idle();
        assert_eq!(promise.inspect_state().value(), Some(&3));
    }

    #[test]
    fn test_rejection_passes_through_and_then() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let promise = Promise::<i32>::rejected(Error::thrown("nope")).and_then(move |n| {
            counter.set(counter.get() + 1);
            Ok::<_, Error>(n)
        });
        run_until_idle();
        assert_eq!(calls.get(), 0);
        assert!(promise.inspect_state().is_rejected());
    }

    #[test]
    fn test_otherwise_recovers() {
        let promise = Promise::rejected(Error::thrown("nope")).otherwise(|_| Ok::<_, Error>(5));
        run_until_idle();
        assert_eq!(promise.inspect_state().value(), Some(&5));
    }

    #[test]
    fn test_then_opt_without_transforms_is_identity() {
        let promise = Promise::fulfilled(1);
        let same = promise.then_opt(
            None::<fn(i32) -> Result<i32, Error>>,
            None::<fn(Error) -> Result<i32, Error>>,
        );
        assert!(same.ptr_eq(&promise));
    }

    #[test]
    fn test_handlers_run_in_attach_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (promise, resolver) = Promise::pending();
        for tag in 0..3 {
            let log = log.clone();
            promise.map(move |n: i32| log.borrow_mut().push((tag, n)));
        }
        resolver.resolve(8);
        run_until_idle();
        assert_eq!(*log.borrow(), [(0, 8), (1, 8), (2, 8)]);
    }

    #[test]
    fn test_nested_promise_result_is_followed() {
        let (inner, inner_resolver) = Promise::pending();
        let outer = Promise::fulfilled(()).and_then(move |_| inner);
        run_until_idle();
        assert!(outer.inspect_state().is_pending());
        let seen = outer.map(|n: u8| n * 2);
        inner_resolver.resolve(21);
        run_until_idle();
        assert_eq!(seen.inspect_state().value(), Some(&42));
    }

    #[test]
    fn test_cancel_before_parent_settles_rejects_parent_too() {
        let (parent, _resolver) = Promise::<i32>::pending();
        let child = parent.map(|n| n + 1);
        child.cancel();
        run_until_idle();
        assert!(parent.inspect_state().reason().map_or(false, Error::is_cancelled));
        assert!(child.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_cancel_after_parent_settles_masks_result() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let child = Promise::fulfilled(1).map(move |n| {
            flag.set(true);
            n
        });
        child.cancel();
        run_until_idle();
        assert!(!ran.get());
        assert!(child.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_cancel_unobserved_nested_promise() {
        let (inner, _inner_resolver) = Promise::<i32>::pending();
        let nested = inner.clone();
        let outer = Promise::fulfilled(()).and_then(move |_| nested);
        run_until_idle();
        outer.cancel();
        assert!(inner.inspect_state().reason().map_or(false, Error::is_cancelled));
        assert!(outer.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_cancel_reaches_nested_promise_through_dropped_intermediate() {
        let (inner, _inner_resolver) = Promise::<i32>::pending();
        let nested = inner.clone();
        // The `and_then` promise is only reachable through `leaf`.
        let leaf = Promise::fulfilled(1).and_then(move |_| nested).map(|n| n + 1);
        run_until_idle();
        leaf.cancel();
        assert!(inner.inspect_state().reason().map_or(false, Error::is_cancelled));
        run_until_idle();
        assert!(leaf.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_cancelling_a_long_pending_chain_is_stack_safe() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let root: Promise<u32> = Promise::new(move |_| {
            Ok(Some(Box::new(move || counter.set(counter.get() + 1)) as OnCancel))
        });
        let mut head = root.clone();
        for _ in 0..50_000 {
            head = head.map(|n| n + 1);
        }
        head.cancel();
        assert_eq!(calls.get(), 1);
        assert!(root.inspect_state().reason().map_or(false, Error::is_cancelled));
        run_until_idle();
        assert!(head.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_cancel_abandons_unobserved_thenable() {
        let invoked = Rc::new(Cell::new(false));
        let flag = invoked.clone();
        let derived = Promise::fulfilled(1).and_then(move |n: i32| {
            Resolution::thenable(from_fn(move |resolver: ThenableResolver<i32>| {
                flag.set(true);
                resolver.resolve(n);
                Ok(())
            }))
        });
        run_until_idle();
        assert!(derived.inspect_state().is_pending());
        derived.cancel();
        assert!(derived.inspect_state().reason().map_or(false, Error::is_cancelled));
        let observed = derived.map(|n| n);
        run_until_idle();
        assert!(!invoked.get());
        assert!(observed.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_thenable_resolving_after_cancel_is_ignored() {
        let slot: Rc<RefCell<Option<ThenableResolver<i32>>>> = Rc::default();
        let keep = slot.clone();
        let derived = Promise::fulfilled(()).and_then(move |_| {
            Resolution::thenable(from_fn(move |resolver: ThenableResolver<i32>| {
                *keep.borrow_mut() = Some(resolver);
                Ok(())
            }))
        });
        let observed = derived.map(|n| n);
        run_until_idle();
        derived.cancel();
        let resolver = slot.borrow_mut().take();
        if let Some(resolver) = resolver {
            resolver.resolve(5);
        }
        run_until_idle();
        assert!(derived.inspect_state().reason().map_or(false, Error::is_cancelled));
        assert!(observed.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_cancel_delegated_forwards_upstream() {
        let (parent, _resolver) = Promise::<i32>::pending();
        let child = parent.map(|n| n);
        let grandchild = child.map(|n| n);
        grandchild.cancel();
        run_until_idle();
        assert!(parent.inspect_state().reason().map_or(false, Error::is_cancelled));
        assert!(grandchild.inspect_state().is_rejected());
    }

    #[test]
    fn test_chain_resolving_to_itself_rejects() {
        let slot: Rc<RefCell<Option<Promise<i32>>>> = Rc::default();
        let hold = slot.clone();
        let promise = Promise::fulfilled(0).and_then(move |_| match hold.borrow_mut().take() {
            Some(me) => Resolution::Promise(me),
            None => Resolution::Value(0),
        });
        *slot.borrow_mut() = Some(promise.clone());
        run_until_idle();
        assert!(matches!(
            promise.inspect_state().reason(),
            Some(Error::TypeMismatch(_))
        ));
    }
}
