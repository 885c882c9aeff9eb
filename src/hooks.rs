//! Unhandled-rejection reporting.
//!
//! Every time a promise becomes rejected the installed [`RejectionTracker`] is
//! told about it and hands back a [`HandledSignal`]. The signal fires (at most
//! once) as soon as something downstream handles that rejection, so a tracker
//! can report only the rejections that are never handled.
//!
//! Promises are single-thread objects, so the tracker is installed per thread.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use crate::Error;

/// Strategy invoked once per rejected transition.
pub trait RejectionTracker {
    fn unhandled(&self, reason: &Error) -> HandledSignal;
}

impl<F> RejectionTracker for F
where
    F: Fn(&Error) -> HandledSignal,
{
    fn unhandled(&self, reason: &Error) -> HandledSignal {
        self(reason)
    }
}

/// Callback fired when a reported rejection gets handled.
#[derive(Clone, Default)]
pub struct HandledSignal {
    inner: Option<Rc<SignalInner>>,
}

struct SignalInner {
    fired: Cell<bool>,
    callback: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl HandledSignal {
    pub fn new(callback: impl FnOnce() + 'static) -> Self {
        Self {
            inner: Some(Rc::new(SignalInner {
                fired: Cell::new(false),
                callback: RefCell::new(Some(Box::new(callback))),
            })),
        }
    }

    /// A signal that does nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        self.inner.as_ref().map_or(false, |inner| inner.fired.get())
    }

    pub(crate) fn signal(&self) {
        let Some(inner) = &self.inner else { return };
        if inner.fired.replace(true) {
            return;
        }
        let callback = inner.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl fmt::Debug for HandledSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandledSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

thread_local! {
    static TRACKER: RefCell<Option<Rc<dyn RejectionTracker>>> = RefCell::new(None);
}

/// Installs `tracker` for the current thread, returning the previous one.
pub fn install(tracker: impl RejectionTracker + 'static) -> Option<Rc<dyn RejectionTracker>> {
    tracing::debug!("installing unhandled-rejection tracker");
    TRACKER.with(|slot| slot.borrow_mut().replace(Rc::new(tracker)))
}

/// Removes the installed tracker; rejections go unreported afterwards.
pub fn reset() -> Option<Rc<dyn RejectionTracker>> {
    TRACKER.with(|slot| slot.borrow_mut().take())
}

pub(crate) fn report(reason: &Error) -> HandledSignal {
    tracing::trace!(%reason, "promise rejected");
    let tracker = TRACKER.with(|slot| slot.borrow().clone());
    match tracker {
        Some(tracker) => tracker.unhandled(reason),
        None => HandledSignal::none(),
    }
}
