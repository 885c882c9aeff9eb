//! `.await` support.

use std::{
    cell::RefCell,
    future::{Future, IntoFuture},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use crate::{
    core::{Outcome, Promise, Waiter},
    scheduler, Error,
};

/// Future resolving once a [`Promise`] settles.
///
/// Polling turns the thread's [`EventLoop`](crate::scheduler::EventLoop), so
/// promises driven by the default host settle under any executor. Awaiting
/// counts as handling a rejection.
pub struct Settled<T> {
    promise: Promise<T>,
    inner: Option<Rc<RefCell<Inner<T>>>>,
}

struct Inner<T> {
    value: Option<Result<T, Error>>,
    waker: Vec<Waker>,
}

impl<T: Clone + 'static> Settled<T> {
    fn subscribe(&self) -> Rc<RefCell<Inner<T>>> {
        let inner = Rc::new(RefCell::new(Inner {
            value: None,
            waker: Vec::new(),
        }));
        let slot = Rc::clone(&inner);
        self.promise.subscribe(Waiter::external(move |outcome| {
            let value = match outcome {
                Outcome::Fulfilled(value) => Ok(value),
                Outcome::Rejected(rejection) => Err(rejection.handle()),
            };
            let wakers = {
                let mut inner = slot.borrow_mut();
                inner.value = Some(value);
                std::mem::take(&mut inner.waker)
            };
            for waker in wakers {
                waker.wake();
            }
        }));
        inner
    }
}

impl<T: Clone + 'static> Future for Settled<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = match self.inner.clone() {
            Some(inner) => inner,
            None => {
                let inner = self.subscribe();
                self.inner = Some(Rc::clone(&inner));
                inner
            }
        };
        scheduler::event_loop().run_until(|| inner.borrow().value.is_some());

        let mut inner = inner.borrow_mut();
        match inner.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                inner.waker.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T: Clone + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Settled<T>;

    fn into_future(self) -> Settled<T> {
        Settled {
            promise: self,
            inner: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::executor::block_on;

    use super::*;

    #[test]
    fn test_await_fulfilled() {
        let promise = Promise::fulfilled(20).map(|n| n + 1);
        assert_eq!(block_on(async { promise.await }).unwrap(), 21);
    }

    #[test]
    fn test_await_rejected_marks_handled() {
        let promise = Promise::<()>::rejected(Error::thrown("bad"));
        let err = block_on(async { promise.await }).unwrap_err();
        assert_eq!(err.downcast_ref::<&str>(), Some(&"bad"));
    }

    #[test]
    fn test_await_drives_timers() {
        let promise = crate::delay(Duration::from_secs(3), "late");
        let start = scheduler::event_loop().now();
        assert_eq!(block_on(async { promise.await }).unwrap(), "late");
        assert!(scheduler::event_loop().now() >= start + Duration::from_secs(3));
    }

    #[test]
    fn test_await_with_external_resolution() {
        let (promise, resolver) = Promise::pending();
        let result = block_on(async move {
            resolver.resolve("done");
            promise.await
        });
        assert_eq!(result.unwrap(), "done");
    }
}
