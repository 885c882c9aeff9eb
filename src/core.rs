//! Promise state machine and value adoption.

use std::{
    any::{type_name, TypeId},
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::Rc,
};

use crate::{
    hooks::{self, HandledSignal},
    scheduler::{self, Task},
    thenable::{self, Thenable},
    Error,
};

/// Cancel callback an executor may hand back.
pub type OnCancel = Box<dyn FnOnce()>;

/// Snapshot returned by [`Promise::inspect_state`].
#[derive(Debug, Clone)]
pub enum PromiseState<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
}

impl<T> PromiseState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, PromiseState::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PromiseState::Rejected(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            PromiseState::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&Error> {
        match self {
            PromiseState::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Runtime identity of a promise type.
///
/// Every promise records the lineage it was built as, and the lineage that
/// chaining on it produces (its species).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lineage {
    id: TypeId,
    name: &'static str,
}

enum Native {}

impl Lineage {
    pub fn of<K: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<K>(),
            name: type_name::<K>(),
        }
    }

    /// Lineage of plain [`Promise`]s.
    pub fn base() -> Self {
        Self {
            id: TypeId::of::<Native>(),
            name: "Promise",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lineage").field(&self.name).finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Options {
    pub(crate) lineage: Lineage,
    pub(crate) species: Lineage,
    pub(crate) cancellable: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lineage: Lineage::base(),
            species: Lineage::base(),
            cancellable: true,
        }
    }
}

impl Options {
    /// Options for a promise standing in for `promise`'s chained results.
    pub(crate) fn derived_from<T>(promise: &Promise<T>) -> Self {
        let species = promise.node.species();
        Self {
            lineage: species,
            species,
            cancellable: true,
        }
    }
}

/// A rejection together with the signal that marks it handled.
#[derive(Clone, Debug)]
pub(crate) struct Rejection {
    pub(crate) reason: Error,
    pub(crate) handled: HandledSignal,
}

impl Rejection {
    /// A fresh rejection, reported to the installed tracker.
    pub(crate) fn report(reason: Error) -> Self {
        let handled = hooks::report(&reason);
        Self { reason, handled }
    }

    /// Consumes the rejection, telling the tracker it was handled.
    pub(crate) fn handle(self) -> Error {
        self.handled.signal();
        self.reason
    }
}

#[derive(Clone)]
pub(crate) enum Outcome<T> {
    Fulfilled(T),
    Rejected(Rejection),
}

/// A continuation waiting on a node.
pub(crate) struct Waiter<T> {
    internal: bool,
    notify: Box<dyn FnOnce(Outcome<T>)>,
}

impl<T> Waiter<T> {
    /// Notified on the next turn. Used for everything user code can observe.
    pub(crate) fn external(notify: impl FnOnce(Outcome<T>) + 'static) -> Self {
        Self {
            internal: false,
            notify: Box::new(notify),
        }
    }

    /// Notified on the same turn, for forwarding between promises.
    pub(crate) fn internal(notify: impl FnOnce(Outcome<T>) + 'static) -> Self {
        Self {
            internal: true,
            notify: Box::new(notify),
        }
    }
}

/// Hands `outcome` to every waiter, preserving registration order.
pub(crate) fn dispatch<T: Clone + 'static>(waiters: Vec<Waiter<T>>, outcome: Outcome<T>) {
    let mut same_turn = VecDeque::new();
    for Waiter { internal, notify } in waiters {
        let outcome = outcome.clone();
        let task: Task = Box::new(move || notify(outcome));
        if internal {
            same_turn.push_back(task);
        } else {
            scheduler::next_turn(task);
        }
    }
    scheduler::same_turn(same_turn);
}

/// Anything a [`Promise`] handle can point at: a settlement core, or the
/// propagator created by chaining.
pub(crate) trait Node<T> {
    fn register(self: Rc<Self>, waiter: Waiter<T>);
    fn outcome(&self) -> Option<Outcome<T>>;
    fn is_pending(&self) -> bool;
    fn cancel(&self);
    fn cancellable(&self) -> bool;
    fn lineage(&self) -> Lineage;
    fn species(&self) -> Lineage;
}

/// What a promise can be resolved with.
pub enum Resolution<T> {
    Value(T),
    Promise(Promise<T>),
    Thenable(Box<dyn Thenable<T>>),
    Rejected(Error),
}

impl<T> Resolution<T> {
    pub fn thenable(thenable: impl Thenable<T> + 'static) -> Self {
        Resolution::Thenable(Box::new(thenable))
    }
}

impl<T> fmt::Debug for Resolution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(_) => f.write_str("Value(..)"),
            Resolution::Promise(_) => f.write_str("Promise(..)"),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
            Resolution::Rejected(reason) => f.debug_tuple("Rejected").field(reason).finish(),
        }
    }
}

/// Conversion into a [`Resolution`]; implemented by everything a transform
/// may return.
pub trait IntoResolution {
    type Value: Clone + 'static;

    fn into_resolution(self) -> Resolution<Self::Value>;
}

impl<T: Clone + 'static> IntoResolution for Resolution<T> {
    type Value = T;

    fn into_resolution(self) -> Resolution<T> {
        self
    }
}

impl<T: Clone + 'static> IntoResolution for Promise<T> {
    type Value = T;

    fn into_resolution(self) -> Resolution<T> {
        Resolution::Promise(self)
    }
}

impl<T: Clone + 'static> IntoResolution for Result<T, Error> {
    type Value = T;

    fn into_resolution(self) -> Resolution<T> {
        match self {
            Ok(value) => Resolution::Value(value),
            Err(reason) => Resolution::Rejected(reason),
        }
    }
}

enum State<T> {
    Pending(Vec<Waiter<T>>),
    Fulfilled(T),
    Rejected(Rejection),
}

/// The settlement core behind promises built from an executor.
pub(crate) struct Core<T> {
    state: RefCell<State<T>>,
    locked: Cell<bool>,
    on_cancel: RefCell<Option<OnCancel>>,
    options: Options,
}

impl<T: Clone + 'static> Core<T> {
    pub(crate) fn construct<F>(executor: F, options: Options) -> Rc<Self>
    where
        F: FnOnce(Resolver<T>) -> Result<Option<OnCancel>, Error>,
    {
        let core = Rc::new(Self {
            state: RefCell::new(State::Pending(Vec::new())),
            locked: Cell::new(false),
            on_cancel: RefCell::new(None),
            options,
        });
        match executor(Resolver {
            core: Rc::clone(&core),
        }) {
            Ok(Some(on_cancel)) => {
                if !core.locked.get() {
                    *core.on_cancel.borrow_mut() = Some(on_cancel);
                }
            }
            Ok(None) => {}
            Err(reason) => core.resolve_with(Resolution::Rejected(reason)),
        }
        core
    }

    /// `resolve` as seen by a [`Resolver`]: only the first call counts.
    pub(crate) fn resolve_with(self: &Rc<Self>, resolution: Resolution<T>) {
        if self.locked.replace(true) || !self.is_pending() {
            return;
        }
        self.adopt(resolution);
    }

    /// Runs the adoption algorithm without looking at the lock.
    pub(crate) fn adopt(self: &Rc<Self>, resolution: Resolution<T>) {
        match resolution {
            Resolution::Value(value) => {
                self.settle(Outcome::Fulfilled(value));
            }
            Resolution::Rejected(reason) => {
                self.settle(Outcome::Rejected(Rejection::report(reason)));
            }
            Resolution::Promise(promise) => self.follow(promise),
            Resolution::Thenable(thenable) => thenable::assimilate(self, thenable),
        }
    }

    fn follow(self: &Rc<Self>, promise: Promise<T>) {
        if promise.is_node(Rc::as_ptr(self)) {
            self.adopt(Resolution::Rejected(Error::type_mismatch(
                "a promise cannot be resolved with itself",
            )));
            return;
        }
        if let Some(outcome) = promise.node.outcome() {
            self.settle(outcome);
            return;
        }
        let inner = promise.clone();
        self.forward_cancel(Box::new(move || inner.cancel()));
        let core = Rc::clone(self);
        promise.subscribe(Waiter::internal(move |outcome| core.forward(outcome)));
    }

    /// Replaces the cancel callback while an adoption is outstanding.
    pub(crate) fn forward_cancel(&self, on_cancel: OnCancel) {
        if self.is_pending() {
            *self.on_cancel.borrow_mut() = Some(on_cancel);
        }
    }

    /// Settles with an outcome observed elsewhere. A rejection that arrives
    /// too late is absorbed here, so it counts as handled.
    pub(crate) fn forward(&self, outcome: Outcome<T>) {
        if !self.settle(outcome.clone()) {
            if let Outcome::Rejected(rejection) = outcome {
                rejection.handle();
            }
        }
    }

    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        let waiters = {
            let mut state = self.state.borrow_mut();
            let State::Pending(waiters) = &mut *state else {
                return false;
            };
            let waiters = std::mem::take(waiters);
            *state = match &outcome {
                Outcome::Fulfilled(value) => State::Fulfilled(value.clone()),
                Outcome::Rejected(rejection) => State::Rejected(rejection.clone()),
            };
            waiters
        };
        self.locked.set(true);
        let on_cancel = self.on_cancel.borrow_mut().take();
        drop(on_cancel);
        dispatch(waiters, outcome);
        true
    }
}

impl<T: Clone + 'static> Node<T> for Core<T> {
    fn register(self: Rc<Self>, waiter: Waiter<T>) {
        let outcome = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Pending(waiters) => {
                    waiters.push(waiter);
                    return;
                }
                State::Fulfilled(value) => Outcome::Fulfilled(value.clone()),
                State::Rejected(rejection) => Outcome::Rejected(rejection.clone()),
            }
        };
        dispatch(vec![waiter], outcome);
    }

    fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.state.borrow() {
            State::Pending(_) => None,
            State::Fulfilled(value) => Some(Outcome::Fulfilled(value.clone())),
            State::Rejected(rejection) => Some(Outcome::Rejected(rejection.clone())),
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), State::Pending(_))
    }

    fn cancel(&self) {
        if !self.options.cancellable || !self.is_pending() {
            return;
        }
        tracing::debug!(lineage = self.options.lineage.name(), "cancelling pending promise");
        let on_cancel = self.on_cancel.borrow_mut().take();
        self.settle(Outcome::Rejected(Rejection::report(Error::cancelled())));
        // A frame rather than a call: the callback may cancel further upstream.
        if let Some(on_cancel) = on_cancel {
            scheduler::same_turn_one(on_cancel);
        }
    }

    fn cancellable(&self) -> bool {
        self.options.cancellable
    }

    fn lineage(&self) -> Lineage {
        self.options.lineage
    }

    fn species(&self) -> Lineage {
        self.options.species
    }
}

/// The resolve/reject capability handed to an executor.
///
/// The first call to any method decides the promise; later calls are ignored.
pub struct Resolver<T> {
    pub(crate) core: Rc<Core<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub fn resolve(&self, value: T) {
        self.core.resolve_with(Resolution::Value(value));
    }

    /// Resolves with a value, a promise to follow, a thenable to assimilate,
    /// or a `Result`.
    pub fn resolve_with(&self, value: impl IntoResolution<Value = T>) {
        self.core.resolve_with(value.into_resolution());
    }

    pub fn reject(&self, reason: Error) {
        self.core.resolve_with(Resolution::Rejected(reason));
    }

    /// Whether a resolve or reject call would still have an effect.
    pub fn is_open(&self) -> bool {
        !self.core.locked.get() && self.core.is_pending()
    }

    pub fn promise(&self) -> Promise<T> {
        Promise {
            node: Rc::clone(&self.core) as Rc<dyn Node<T>>,
        }
    }

    /// Locks the promise and mirrors `outcome` into it.
    pub(crate) fn forward(&self, outcome: Outcome<T>) {
        if self.core.locked.replace(true) {
            if let Outcome::Rejected(rejection) = outcome {
                rejection.handle();
            }
            return;
        }
        self.core.forward(outcome);
    }
}

/// A cancellable deferred value.
///
/// Handles are cheap to clone; clones refer to the same promise.
pub struct Promise<T> {
    pub(crate) node: Rc<dyn Node<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("lineage", &self.lineage())
            .field("state", &self.inspect_state())
            .finish()
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Runs `executor` synchronously with the resolve/reject capability.
    ///
    /// Returning `Err` rejects the promise (unless it was already resolved);
    /// returning `Ok(Some(cb))` registers `cb` to run if the promise is
    /// cancelled while pending.
    ///
    /// # Examples
    ///
    /// ```
    /// use thenable::Promise;
    ///
    /// let promise = Promise::new(|resolver| {
    ///     resolver.resolve("🍓");
    ///     Ok(None)
    /// });
    /// assert_eq!(promise.inspect_state().value(), Some(&"🍓"));
    /// ```
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<Option<OnCancel>, Error>,
    {
        Self::construct(executor, Options::default())
    }

    pub(crate) fn construct<F>(executor: F, options: Options) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<Option<OnCancel>, Error>,
    {
        Self {
            node: Core::construct(executor, options),
        }
    }

    /// A pending promise together with its resolver.
    pub fn pending() -> (Self, Resolver<T>) {
        let core = Core::construct(|_| Ok(None), Options::default());
        let promise = Self {
            node: Rc::clone(&core) as Rc<dyn Node<T>>,
        };
        (promise, Resolver { core })
    }

    pub fn fulfilled(value: T) -> Self {
        Self::resolved(Resolution::Value(value))
    }

    pub fn rejected(reason: Error) -> Self {
        Self::resolved(Resolution::Rejected(reason))
    }

    /// Builds a promise from anything resolvable. A plain promise is returned
    /// as is; thenables are assimilated.
    pub fn resolved(value: impl IntoResolution<Value = T>) -> Self {
        match value.into_resolution() {
            Resolution::Promise(promise) if promise.lineage() == Lineage::base() => promise,
            resolution => Self::new(move |resolver| {
                resolver.core.resolve_with(resolution);
                Ok(None)
            }),
        }
    }

    pub fn inspect_state(&self) -> PromiseState<T> {
        match self.node.outcome() {
            None => PromiseState::Pending,
            Some(Outcome::Fulfilled(value)) => PromiseState::Fulfilled(value),
            Some(Outcome::Rejected(rejection)) => PromiseState::Rejected(rejection.reason),
        }
    }

    /// Rejects the promise with [`Error::Cancelled`] if it is still pending.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    pub fn is_cancellable(&self) -> bool {
        self.node.cancellable()
    }

    pub fn lineage(&self) -> Lineage {
        self.node.lineage()
    }

    /// Lineage of the promises chaining on this one produces.
    pub fn species(&self) -> Lineage {
        self.node.species()
    }

    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        self.is_node(Rc::as_ptr(&other.node))
    }

    pub(crate) fn is_node<N: ?Sized>(&self, node: *const N) -> bool {
        Rc::as_ptr(&self.node) as *const () == node as *const ()
    }

    pub(crate) fn subscribe(&self, waiter: Waiter<T>) {
        Rc::clone(&self.node).register(waiter);
    }
}
