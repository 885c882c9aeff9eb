//! Time-based promises, scheduled through the host's timer deferral.

use std::time::Duration;

use crate::{combinators::race, core::Promise, error::TimeoutError, scheduler};

/// Fulfills with `value` once `after` has elapsed. Cancelling it withdraws
/// the timer.
pub fn delay<T: Clone + 'static>(after: Duration, value: T) -> Promise<T> {
    Promise::new(move |resolver| {
        let disarm = scheduler::defer_after(after, Box::new(move || resolver.resolve(value)));
        Ok(Some(disarm))
    })
}

/// Settles like `promise`, unless `after` elapses first. Then it rejects
/// with [`Error::Timeout`](crate::Error::Timeout) and `promise` is cancelled.
/// If `promise` wins, the deadline timer is withdrawn.
pub fn timeout<T: Clone + 'static>(promise: &Promise<T>, after: Duration) -> Promise<T> {
    let deadline = Promise::new(move |resolver| {
        let disarm = scheduler::defer_after(
            after,
            Box::new(move || resolver.reject(TimeoutError { after }.into())),
        );
        Ok(Some(disarm))
    });
    race([promise.clone(), deadline])
}

impl<T: Clone + 'static> Promise<T> {
    /// See [`timeout`].
    pub fn timeout(&self, after: Duration) -> Promise<T> {
        timeout(self, after)
    }

    /// Settles like `self`, `after` later.
    pub fn delay(&self, after: Duration) -> Promise<T> {
        self.and_then(move |value| delay(after, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scheduler::event_loop, Error};

    #[test]
    fn test_delay_fires_on_the_virtual_clock() {
        let promise = delay(Duration::from_millis(50), 'x');
        let clock = event_loop();
        clock.advance(Duration::from_millis(49));
        assert!(promise.inspect_state().is_pending());
        clock.advance(Duration::from_millis(1));
        assert_eq!(promise.inspect_state().value(), Some(&'x'));
    }

    #[test]
    fn test_timeout_rejects_and_cancels() {
        let (slow, _resolver) = Promise::<u8>::pending();
        let guarded = slow.timeout(Duration::from_secs(1));
        event_loop().advance(Duration::from_secs(1));
        event_loop().run_until_idle();
        assert!(guarded.inspect_state().reason().map_or(false, Error::is_timeout));
        assert!(slow.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_timeout_passes_fast_result() {
        let guarded = delay(Duration::from_millis(5), 1).timeout(Duration::from_millis(10));
        event_loop().run();
        assert_eq!(guarded.inspect_state().value(), Some(&1));
    }

    #[test]
    fn test_losing_deadline_is_withdrawn() {
        let clock = event_loop();
        let start = clock.now();
        let guarded = delay(Duration::from_millis(5), 'a').timeout(Duration::from_secs(30));
        clock.run();
        assert_eq!(guarded.inspect_state().value(), Some(&'a'));
        assert!(clock.is_idle());
        assert_eq!(clock.pending_timers(), 0);
        assert_eq!(clock.now(), start + Duration::from_millis(5));
    }

    #[test]
    fn test_cancelled_delay_never_fires() {
        let clock = event_loop();
        let promise = delay(Duration::from_millis(8), 1u8);
        promise.cancel();
        assert_eq!(clock.pending_timers(), 0);
        clock.run();
        assert!(promise.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    #[test]
    fn test_delay_method_chains() {
        let promise = Promise::fulfilled("later").delay(Duration::from_millis(3));
        event_loop().run();
        assert_eq!(promise.inspect_state().value(), Some(&"later"));
    }
}
