//! Static combinators over collections of promises.
//!
//! All of them run on [`map_parallel`], so the first decisive settlement
//! cancels every input still pending.

use std::{cell::RefCell, collections::HashMap, hash::Hash, rc::Rc};

use crate::{
    core::{IntoResolution, Promise, PromiseState},
    iterate::{map_parallel, shortcut, take_shortcut},
    Error,
};

/// Callback handed to a function wrapped by [`denodeify`].
pub type Callback<T> = Box<dyn FnOnce(Result<T, Error>)>;

/// Fulfills with every input's value, in input order, or rejects with the
/// first rejection.
///
/// # Examples
///
/// ```
/// use futures::executor::block_on;
/// use thenable::{all, Promise};
///
/// let values = all(vec![Promise::fulfilled(1), Promise::fulfilled(2)]);
/// assert_eq!(block_on(async { values.await }).unwrap(), vec![1, 2]);
/// ```
pub fn all<I, R>(items: I) -> Promise<Vec<R::Value>>
where
    I: IntoIterator<Item = R>,
    R: IntoResolution + 'static,
{
    map_parallel(items, |item| item)
}

/// [`all`] over a keyed collection.
pub fn all_keyed<I, K, R>(entries: I) -> Promise<HashMap<K, R::Value>>
where
    I: IntoIterator<Item = (K, R)>,
    K: Eq + Hash + Clone + 'static,
    R: IntoResolution + 'static,
{
    let (keys, values): (Vec<K>, Vec<R>) = entries.into_iter().unzip();
    all(values).map(move |values| keys.into_iter().zip(values).collect())
}

/// Fulfills with the first input to fulfill. If every input rejects, rejects
/// with the last reason; with no inputs, rejects with a type mismatch.
pub fn any<I, R>(items: I) -> Promise<R::Value>
where
    I: IntoIterator<Item = R>,
    R: IntoResolution + 'static,
{
    let last = Rc::new(RefCell::new(None::<Error>));
    let record = Rc::clone(&last);
    map_parallel(items, move |item| {
        let record = Rc::clone(&record);
        Promise::resolved(item).then(
            |value| Err::<(), Error>(shortcut(value)),
            move |reason| {
                *record.borrow_mut() = Some(reason);
                Ok::<(), Error>(())
            },
        )
    })
    .then(
        move |_| {
            let reason = last.borrow_mut().take();
            Err::<R::Value, Error>(
                reason.unwrap_or_else(|| Error::type_mismatch("any() needs at least one input")),
            )
        },
        take_shortcut::<R::Value>,
    )
}

/// Fulfills with the values of the inputs that fulfilled, in input order.
/// Rejects with the last reason only if every input rejected.
pub fn some<I, R>(items: I) -> Promise<Vec<R::Value>>
where
    I: IntoIterator<Item = R>,
    R: IntoResolution + 'static,
{
    let last = Rc::new(RefCell::new(None::<Error>));
    settled_values(items, Rc::clone(&last)).and_then(move |settled: Vec<Option<R::Value>>| {
        if !settled.is_empty() && settled.iter().all(Option::is_none) {
            let reason = last.borrow_mut().take();
            return Err(reason.unwrap_or_else(|| Error::type_mismatch("no input fulfilled")));
        }
        Ok(settled.into_iter().flatten().collect::<Vec<_>>())
    })
}

/// [`some`] over a keyed collection: keys whose input rejected are absent.
pub fn some_keyed<I, K, R>(entries: I) -> Promise<HashMap<K, R::Value>>
where
    I: IntoIterator<Item = (K, R)>,
    K: Eq + Hash + Clone + 'static,
    R: IntoResolution + 'static,
{
    let (keys, values): (Vec<K>, Vec<R>) = entries.into_iter().unzip();
    let last = Rc::new(RefCell::new(None::<Error>));
    settled_values(values, Rc::clone(&last)).and_then(move |settled: Vec<Option<R::Value>>| {
        if !settled.is_empty() && settled.iter().all(Option::is_none) {
            let reason = last.borrow_mut().take();
            return Err(reason.unwrap_or_else(|| Error::type_mismatch("no input fulfilled")));
        }
        Ok(keys
            .into_iter()
            .zip(settled)
            .filter_map(|(key, value)| Some((key, value?)))
            .collect::<HashMap<_, _>>())
    })
}

fn settled_values<I, R>(items: I, last: Rc<RefCell<Option<Error>>>) -> Promise<Vec<Option<R::Value>>>
where
    I: IntoIterator<Item = R>,
    R: IntoResolution + 'static,
{
    map_parallel(items, move |item| {
        let record = Rc::clone(&last);
        Promise::resolved(item).then(
            |value| Ok::<_, Error>(Some(value)),
            move |reason| {
                *record.borrow_mut() = Some(reason);
                Ok::<_, Error>(None)
            },
        )
    })
}

/// Settles like the first input to settle. The others are cancelled. With
/// no inputs, rejects with a type mismatch.
pub fn race<I, R>(items: I) -> Promise<R::Value>
where
    I: IntoIterator<Item = R>,
    R: IntoResolution + 'static,
{
    map_parallel(items, |item| {
        Promise::resolved(item).then(
            |value| Err::<(), Error>(shortcut(Ok::<R::Value, Error>(value))),
            |reason| Err::<(), Error>(shortcut(Err::<R::Value, Error>(reason))),
        )
    })
    .then(
        |_| Err::<R::Value, Error>(Error::type_mismatch("race() needs at least one input")),
        |reason| take_shortcut::<Result<R::Value, Error>>(reason).and_then(|settled| settled),
    )
}

/// Tuples of promises that can be awaited together.
pub trait Join {
    type Output: Clone + 'static;

    fn join(self) -> Promise<Self::Output>;
}

/// Fulfills with a tuple of the inputs' values once all fulfill.
pub fn join<J: Join>(promises: J) -> Promise<J::Output> {
    promises.join()
}

fn fulfilled_value<T: Clone + 'static>(promise: &Promise<T>) -> Result<T, Error> {
    match promise.inspect_state() {
        PromiseState::Fulfilled(value) => Ok(value),
        PromiseState::Rejected(reason) => Err(reason),
        PromiseState::Pending => Err(Error::type_mismatch("joined promise is still pending")),
    }
}

macro_rules! impl_join {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: Clone + 'static),+> Join for ($(Promise<$name>,)+) {
            type Output = ($($name,)+);

            fn join(self) -> Promise<Self::Output> {
                let parts = vec![$(self.$index.yield_value(())),+];
                all(parts).and_then(move |_| Ok::<_, Error>(($(fulfilled_value(&self.$index)?,)+)))
            }
        }
    };
}

impl_join!(A: 0, B: 1);
impl_join!(A: 0, B: 1, C: 2);
impl_join!(A: 0, B: 1, C: 2, D: 3);
impl_join!(A: 0, B: 1, C: 2, D: 3, E: 4);

/// Adapts a callback-style function into one returning promises.
///
/// # Examples
///
/// ```
/// use thenable::{denodeify, Callback};
///
/// let parse = denodeify(|text: &'static str, done: Callback<u32>| {
///     done(text.parse().map_err(thenable::Error::custom))
/// });
/// assert_eq!(parse("12").inspect_state().value(), Some(&12));
/// assert!(parse("x").inspect_state().is_rejected());
/// ```
pub fn denodeify<A, T, F>(f: F) -> impl Fn(A) -> Promise<T>
where
    F: Fn(A, Callback<T>),
    T: Clone + 'static,
{
    move |args| {
        Promise::new(|resolver| {
            f(args, Box::new(move |result: Result<T, Error>| resolver.resolve_with(result)));
            Ok(None)
        })
    }
}
