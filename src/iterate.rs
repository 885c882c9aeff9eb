//! Bounded-concurrency iteration.
//!
//! [`map_limited`] is the one engine. It keeps at most `limit` iterator
//! results unsettled at a time, admits inputs strictly in order, and stops at
//! the first failure, cancelling everything still in flight. The other
//! helpers here are thin wrappers; the ones that can finish early
//! ([`detect`], [`some`], [`every`]) do it by failing the engine with a
//! private sentinel that the outer promise turns back into a value.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::{Rc, Weak},
};

use crate::{
    core::{IntoResolution, OnCancel, Outcome, Promise, Resolution, Resolver, Waiter},
    error::Thrown,
    Error,
};

/// How many iterator results may be pending at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Concurrency {
    Series,
    Limited(usize),
    #[default]
    Parallel,
}

impl Concurrency {
    pub fn limit(self) -> usize {
        match self {
            Concurrency::Series => 1,
            Concurrency::Limited(limit) => limit,
            Concurrency::Parallel => usize::MAX,
        }
    }
}

/// Maps `items` through `iterator`, keeping at most `limit` results pending.
///
/// Fulfills with the results in input order. A `limit` of zero rejects with
/// [`Error::TypeMismatch`]. Cancelling the returned promise cancels every
/// result still in flight and stops admission.
///
/// # Examples
///
/// ```
/// use futures::executor::block_on;
/// use thenable::{map_limited, Error};
///
/// let doubled = map_limited(vec![1, 2, 3], 2, |n| Ok::<_, Error>(n * 2));
/// assert_eq!(block_on(async { doubled.await }).unwrap(), vec![2, 4, 6]);
/// ```
pub fn map_limited<I, F, R>(items: I, limit: usize, iterator: F) -> Promise<Vec<R::Value>>
where
    I: IntoIterator,
    I::Item: 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution,
{
    if limit == 0 {
        return Promise::rejected(Error::type_mismatch("concurrency limit must be at least 1"));
    }
    let pending: VecDeque<I::Item> = items.into_iter().collect();
    if pending.is_empty() {
        return Promise::fulfilled(Vec::new());
    }
    Promise::new(move |resolver| {
        let total = pending.len();
        tracing::trace!(total, limit, "starting bounded iteration");
        let run = Rc::new(Run {
            state: RefCell::new(RunState {
                pending,
                cursor: 0,
                results: (0..total).map(|_| None).collect(),
                in_flight: BTreeMap::new(),
                finished: false,
            }),
            iterator: RefCell::new(iterator),
            limit,
            resolver,
        });
        run.admit();
        let run: Weak<Run<I::Item, R::Value, F>> = Rc::downgrade(&run);
        let on_cancel: OnCancel = Box::new(move || {
            if let Some(run) = run.upgrade() {
                run.fail(Error::cancelled());
            }
        });
        Ok(Some(on_cancel))
    })
}

pub fn map_parallel<I, F, R>(items: I, iterator: F) -> Promise<Vec<R::Value>>
where
    I: IntoIterator,
    I::Item: 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution,
{
    map_limited(items, usize::MAX, iterator)
}

pub fn map_series<I, F, R>(items: I, iterator: F) -> Promise<Vec<R::Value>>
where
    I: IntoIterator,
    I::Item: 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution,
{
    map_limited(items, 1, iterator)
}

pub fn map<I, F, R>(items: I, concurrency: Concurrency, iterator: F) -> Promise<Vec<R::Value>>
where
    I: IntoIterator,
    I::Item: 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution,
{
    map_limited(items, concurrency.limit(), iterator)
}

/// Keeps the items `predicate` accepts, in input order.
pub fn filter<I, F, R>(items: I, concurrency: Concurrency, predicate: F) -> Promise<Vec<I::Item>>
where
    I: IntoIterator,
    I::Item: Clone + 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution<Value = bool>,
{
    let items: Vec<I::Item> = items.into_iter().collect();
    let kept = items.clone();
    map(items, concurrency, predicate).map(move |verdicts| {
        kept.into_iter()
            .zip(verdicts)
            .filter_map(|(item, keep)| keep.then_some(item))
            .collect()
    })
}

/// The first item (in completion order) `predicate` accepts, if any.
pub fn detect<I, F, R>(items: I, concurrency: Concurrency, predicate: F) -> Promise<Option<I::Item>>
where
    I: IntoIterator,
    I::Item: Clone + 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution<Value = bool>,
{
    let mut predicate = predicate;
    map(items, concurrency, move |item: I::Item| {
        let candidate = item.clone();
        exit_when(predicate(item), true, move || candidate)
    })
    .then(
        |_| Ok::<_, Error>(None),
        |reason| take_shortcut::<I::Item>(reason).map(Some),
    )
}

/// Whether `predicate` accepts any item. Stops invoking it at the first hit.
pub fn some<I, F, R>(items: I, concurrency: Concurrency, predicate: F) -> Promise<bool>
where
    I: IntoIterator,
    I::Item: 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution<Value = bool>,
{
    let mut predicate = predicate;
    map(items, concurrency, move |item| exit_when(predicate(item), true, || true))
        .then(|_| Ok::<_, Error>(false), take_shortcut::<bool>)
}

/// Whether `predicate` accepts every item. Stops invoking it at the first miss.
pub fn every<I, F, R>(items: I, concurrency: Concurrency, predicate: F) -> Promise<bool>
where
    I: IntoIterator,
    I::Item: 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution<Value = bool>,
{
    let mut predicate = predicate;
    map(items, concurrency, move |item| exit_when(predicate(item), false, || false))
        .then(|_| Ok::<_, Error>(true), take_shortcut::<bool>)
}

/// Stable sort by a key the iterator may compute asynchronously.
pub fn sort_by<I, F, R>(items: I, concurrency: Concurrency, key: F) -> Promise<Vec<I::Item>>
where
    I: IntoIterator,
    I::Item: Clone + 'static,
    F: FnMut(I::Item) -> R + 'static,
    R: IntoResolution,
    R::Value: Ord,
{
    let items: Vec<I::Item> = items.into_iter().collect();
    let originals = items.clone();
    map(items, concurrency, key).map(move |keys| {
        let mut keyed: Vec<_> = keys.into_iter().zip(originals).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, item)| item).collect()
    })
}

/// Sequential left fold; each step may return a promise.
pub fn fold_left<I, F, A, R>(items: I, init: A, reducer: F) -> Promise<A>
where
    I: IntoIterator,
    I::Item: 'static,
    A: Clone + 'static,
    F: FnMut(A, I::Item) -> R + 'static,
    R: IntoResolution<Value = A>,
{
    fold(items.into_iter().collect(), init, reducer)
}

/// Sequential right fold, visiting items from the end.
pub fn fold_right<I, F, A, R>(items: I, init: A, reducer: F) -> Promise<A>
where
    I: IntoIterator,
    I::Item: 'static,
    A: Clone + 'static,
    F: FnMut(A, I::Item) -> R + 'static,
    R: IntoResolution<Value = A>,
{
    let mut items: Vec<I::Item> = items.into_iter().collect();
    items.reverse();
    fold(items, init, reducer)
}

fn fold<T, F, A, R>(items: Vec<T>, init: A, mut reducer: F) -> Promise<A>
where
    T: 'static,
    A: Clone + 'static,
    F: FnMut(A, T) -> R + 'static,
    R: IntoResolution<Value = A>,
{
    let accumulator = Rc::new(RefCell::new(Some(init.clone())));
    map_series(items, move |item| {
        let Some(current) = accumulator.borrow_mut().take() else {
            return Resolution::Rejected(Error::type_mismatch("fold step ran out of order"));
        };
        match reducer(current, item).into_resolution() {
            Resolution::Value(next) => {
                *accumulator.borrow_mut() = Some(next.clone());
                Resolution::Value(next)
            }
            Resolution::Rejected(reason) => Resolution::Rejected(reason),
            pending => {
                let slot = Rc::clone(&accumulator);
                Resolution::Promise(Promise::resolved(pending).map(move |next| {
                    *slot.borrow_mut() = Some(next.clone());
                    next
                }))
            }
        }
    })
    .map(move |mut steps| steps.pop().unwrap_or(init))
}

/// Early-exit payload. Never visible outside this crate.
struct Shortcut<V>(V);

pub(crate) fn shortcut<V: 'static>(value: V) -> Error {
    Error::Thrown(Thrown::opaque(Shortcut(value), "iteration finished early"))
}

/// Recovers a value passed to [`shortcut`]; other reasons come back as `Err`.
pub(crate) fn take_shortcut<V: Clone + 'static>(reason: Error) -> Result<V, Error> {
    if let Some(Shortcut(value)) = reason.downcast_ref::<Shortcut<V>>() {
        return Ok(value.clone());
    }
    Err(reason)
}

/// Turns a verdict into a step result that fails with the sentinel as soon
/// as the verdict equals `exit_on`. Synchronous verdicts are checked right
/// away so no further items are admitted.
fn exit_when<R, V>(verdict: R, exit_on: bool, payload: impl FnOnce() -> V + 'static) -> Resolution<()>
where
    R: IntoResolution<Value = bool>,
    V: 'static,
{
    match verdict.into_resolution() {
        Resolution::Value(hit) if hit == exit_on => Resolution::Rejected(shortcut(payload())),
        Resolution::Value(_) => Resolution::Value(()),
        Resolution::Rejected(reason) => Resolution::Rejected(reason),
        pending => Resolution::Promise(Promise::resolved(pending).and_then(move |hit| {
            if hit == exit_on {
                Err(shortcut(payload()))
            } else {
                Ok(())
            }
        })),
    }
}

struct RunState<T, U> {
    pending: VecDeque<T>,
    cursor: usize,
    results: Vec<Option<U>>,
    in_flight: BTreeMap<usize, Promise<U>>,
    finished: bool,
}

struct Run<T, U, F> {
    state: RefCell<RunState<T, U>>,
    iterator: RefCell<F>,
    limit: usize,
    resolver: Resolver<Vec<U>>,
}

impl<T, U, F, R> Run<T, U, F>
where
    T: 'static,
    U: Clone + 'static,
    F: FnMut(T) -> R + 'static,
    R: IntoResolution<Value = U>,
{
    fn admit(self: &Rc<Self>) {
        loop {
            let (index, item) = {
                let mut state = self.state.borrow_mut();
                if state.finished || state.in_flight.len() >= self.limit {
                    return;
                }
                let Some(item) = state.pending.pop_front() else {
                    break;
                };
                let index = state.cursor;
                state.cursor += 1;
                (index, item)
            };
            let step = (*self.iterator.borrow_mut())(item).into_resolution();
            match step {
                Resolution::Value(value) => self.state.borrow_mut().results[index] = Some(value),
                Resolution::Rejected(reason) => return self.fail(reason),
                Resolution::Promise(promise) => self.watch(index, promise),
                thenable @ Resolution::Thenable(_) => self.watch(index, Promise::resolved(thenable)),
            }
        }
        self.finish_if_done();
    }

    fn watch(self: &Rc<Self>, index: usize, promise: Promise<U>) {
        self.state.borrow_mut().in_flight.insert(index, promise.clone());
        let run = Rc::clone(self);
        promise.subscribe(Waiter::external(move |outcome| run.settled(index, outcome)));
    }

    fn settled(self: &Rc<Self>, index: usize, outcome: Outcome<U>) {
        let finished = {
            let mut state = self.state.borrow_mut();
            state.in_flight.remove(&index);
            state.finished
        };
        match outcome {
            Outcome::Rejected(rejection) => self.fail(rejection.handle()),
            Outcome::Fulfilled(_) if finished => {}
            Outcome::Fulfilled(value) => {
                self.state.borrow_mut().results[index] = Some(value);
                self.admit();
            }
        }
    }

    fn fail(&self, reason: Error) {
        let in_flight = {
            let mut state = self.state.borrow_mut();
            if state.finished {
                return;
            }
            state.finished = true;
            state.pending.clear();
            std::mem::take(&mut state.in_flight)
        };
        if !in_flight.is_empty() {
            tracing::debug!(in_flight = in_flight.len(), "cancelling remaining iteration work");
        }
        for promise in in_flight.into_values() {
            promise.cancel();
        }
        self.resolver.reject(reason);
    }

    fn finish_if_done(&self) {
        let results = {
            let mut state = self.state.borrow_mut();
            if state.finished || !state.pending.is_empty() || !state.in_flight.is_empty() {
                return;
            }
            state.finished = true;
            std::mem::take(&mut state.results)
        };
        self.resolver.resolve(results.into_iter().flatten().collect());
    }
}
