#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
    };

    use proptest::prelude::*;
    use thenable::{
        iterate::{self, Concurrency},
        map_limited,
        scheduler::run_until_idle,
        Error, Promise, Resolver,
    };

    type Gates = Rc<RefCell<Vec<(usize, Resolver<usize>)>>>;

    /// Map over `0..len` where every result is a promise the test settles by hand.
    /// Returns the outer promise, the open gates and the peak number in flight.
    fn gated(len: usize, limit: usize) -> (Promise<Vec<usize>>, Gates, Rc<Cell<usize>>, Rc<Cell<usize>>) {
        let gates: Gates = Rc::default();
        let active = Rc::new(Cell::new(0));
        let peak = Rc::new(Cell::new(0));
        let (open, now, high) = (gates.clone(), active.clone(), peak.clone());
        let promise = map_limited(0..len, limit, move |index| {
            now.set(now.get() + 1);
            high.set(high.get().max(now.get()));
            let (promise, resolver) = Promise::pending();
            open.borrow_mut().push((index, resolver));
            let now = now.clone();
            promise.tap(move |_| {
                now.set(now.get() - 1);
                Ok::<_, Error>(())
            })
        });
        (promise, gates, active, peak)
    }

    fn release(gates: &Gates, index: usize) {
        let resolver = {
            let mut open = gates.borrow_mut();
            let position = open.iter().position(|(i, _)| *i == index);
            position.map(|position| open.remove(position).1)
        };
        if let Some(resolver) = resolver {
            resolver.resolve(index * 3);
        }
        run_until_idle();
    }

    #[test]
    fn test_series_invokes_iterator_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let log = order.clone();
        let squares = map_limited(vec![1, 2, 3], 1, move |n: i32| {
            log.borrow_mut().push(n);
            Promise::fulfilled(n * n)
        });
        assert_eq!(*order.borrow(), [1]);
        run_until_idle();
        assert_eq!(squares.inspect_state().value(), Some(&vec![1, 4, 9]));
        assert_eq!(*order.borrow(), [1, 2, 3]);
    }

    #[test]
    fn test_stuck_item_blocks_admission_beyond_limit() {
        let (promise, gates, _, peak) = gated(10, 2);
        // Item 3 never settles; with two slots only one more item may run beside it.
        release(&gates, 0);
        release(&gates, 1);
        release(&gates, 2);
        let admitted: Vec<usize> = gates.borrow().iter().map(|(i, _)| *i).collect();
        assert_eq!(admitted, [3, 4]);
        release(&gates, 4);
        let admitted: Vec<usize> = gates.borrow().iter().map(|(i, _)| *i).collect();
        assert_eq!(admitted, [3, 5]);
        assert!(promise.inspect_state().is_pending());
        assert!(peak.get() <= 2);
    }

    #[test]
    fn test_some_invokes_predicate_exactly_twice() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let found = iterate::some([1, 2, 3], Concurrency::Parallel, move |n| {
            counter.set(counter.get() + 1);
            Ok::<_, Error>(n == 2)
        });
        run_until_idle();
        assert_eq!(found.inspect_state().value(), Some(&true));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_failure_cancels_every_in_flight_result() {
        let (promise, gates, _, _) = gated(4, 4);
        let in_flight: Vec<Promise<usize>> = gates.borrow().iter().map(|(_, r)| r.promise()).collect();
        if let Some((_, resolver)) = gates.borrow_mut().pop() {
            resolver.reject(Error::thrown("fourth failed"));
        }
        run_until_idle();
        assert!(promise.inspect_state().is_rejected());
        for pending in &in_flight[..3] {
            assert!(pending.inspect_state().reason().map_or(false, Error::is_cancelled));
        }
    }

    #[test]
    fn test_outer_cancel_stops_everything() {
        let (promise, gates, _, _) = gated(6, 2);
        let in_flight: Vec<Promise<usize>> = gates.borrow().iter().map(|(_, r)| r.promise()).collect();
        promise.cancel();
        run_until_idle();
        assert_eq!(gates.borrow().len(), 2);
        assert!(in_flight.iter().all(|p| p.inspect_state().is_rejected()));
        assert!(promise.inspect_state().reason().map_or(false, Error::is_cancelled));
    }

    proptest! {
        #[test]
        fn prop_results_follow_input_order(
            len in 1usize..24,
            limit in 1usize..6,
            seed in any::<u64>(),
        ) {
            let (promise, gates, active, peak) = gated(len, limit);
            let mut state = seed;
            while !gates.borrow().is_empty() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let open = gates.borrow().len();
                let pick = gates.borrow()[(state >> 33) as usize % open].0;
                release(&gates, pick);
            }
            let expected: Vec<usize> = (0..len).map(|i| i * 3).collect();
            let inspected = promise.inspect_state();
            prop_assert_eq!(inspected.value(), Some(&expected));
            prop_assert!(peak.get() <= limit);
            prop_assert_eq!(active.get(), 0);
        }

        #[test]
        fn prop_settles_once(ops in prop::collection::vec(0u8..3, 1..8)) {
            let (promise, resolver) = Promise::<u8>::pending();
            for (step, op) in ops.iter().enumerate() {
                match op {
                    0 => resolver.resolve(step as u8),
                    1 => resolver.reject(Error::thrown(step as u8)),
                    _ => promise.cancel(),
                }
            }
            let state = promise.inspect_state();
            match ops[0] {
                0 => prop_assert_eq!(state.value(), Some(&0)),
                1 => prop_assert_eq!(state.reason().and_then(|e| e.downcast_ref::<u8>()), Some(&0)),
                _ => prop_assert!(state.reason().map_or(false, Error::is_cancelled)),
            }
        }
    }
}
