//! Trampoline scheduling for promise continuations.
//!
//! Two scheduling classes exist:
//!
//! * **next turn**: continuations a user registered. They are appended to a
//!   batch and the whole batch is drained from a single [`Host::defer`]
//!   callback, so they never run on the stack that settled the promise.
//! * **same turn**: internal forwarding (adoption of nested promises, thenable
//!   assimilation). Work is pushed as a frame on an explicit stack and drained
//!   iteratively; a frame pushed while another is draining is finished first,
//!   mirroring nested calls without growing the call stack.
//!
//! The host that provides deferral is pluggable. By default every thread gets
//! an [`EventLoop`] with a virtual clock that the caller turns by hand.

use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    rc::Rc,
    time::Duration,
};

pub type Task = Box<dyn FnOnce()>;

/// Withdraws a timer that has not fired yet.
pub type Disarm = Box<dyn FnOnce()>;

/// Deferred-callback primitive of the environment the promises live in.
pub trait Host {
    /// Runs `task` as soon as possible, but not on the current stack.
    fn defer(&self, task: Task);

    /// Runs `task` once `delay` has elapsed, unless the returned [`Disarm`]
    /// is called first.
    fn defer_after(&self, delay: Duration, task: Task) -> Disarm;
}

struct Trampoline {
    host: RefCell<Rc<dyn Host>>,
    batch: RefCell<VecDeque<Task>>,
    flush_requested: Cell<bool>,
    frames: RefCell<Vec<VecDeque<Task>>>,
    draining: Cell<bool>,
}

thread_local! {
    static EVENT_LOOP: Rc<EventLoop> = Rc::new(EventLoop::default());
    static TRAMPOLINE: Trampoline = Trampoline {
        host: RefCell::new(EVENT_LOOP.with(|event_loop| Rc::clone(event_loop) as Rc<dyn Host>)),
        batch: RefCell::new(VecDeque::new()),
        flush_requested: Cell::new(false),
        frames: RefCell::new(Vec::new()),
        draining: Cell::new(false),
    };
}

/// Queues `task` for the next turn.
pub(crate) fn next_turn(task: Task) {
    let host = TRAMPOLINE.with(|trampoline| {
        trampoline.batch.borrow_mut().push_back(task);
        if trampoline.flush_requested.replace(true) {
            None
        } else {
            Some(Rc::clone(&trampoline.host.borrow()))
        }
    });
    if let Some(host) = host {
        host.defer(Box::new(flush));
    }
}

fn flush() {
    let _guard = FlushGuard;
    let mut ran = 0usize;
    loop {
        let task = TRAMPOLINE.with(|trampoline| trampoline.batch.borrow_mut().pop_front());
        let Some(task) = task else { break };
        task();
        ran += 1;
    }
    tracing::trace!(ran, "drained next-turn batch");
}

/// Lets the next `next_turn` request a flush again, even after a task panicked.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with(|trampoline| trampoline.flush_requested.set(false));
    }
}

/// Runs `tasks` on the same turn, in order, without recursing.
///
/// Called while a same-turn drain is in progress, the frame is pushed on top
/// of the stack and returns immediately; the active drain picks it up before
/// it resumes the frame that scheduled it.
pub(crate) fn same_turn(tasks: VecDeque<Task>) {
    if tasks.is_empty() {
        return;
    }
    let nested = TRAMPOLINE.with(|trampoline| {
        trampoline.frames.borrow_mut().push(tasks);
        trampoline.draining.replace(true)
    });
    if nested {
        return;
    }
    let _guard = DrainGuard;
    while let Some(task) = TRAMPOLINE.with(Trampoline::pop_frame_task) {
        task();
    }
}

pub(crate) fn same_turn_one(task: Task) {
    same_turn(VecDeque::from([task]));
}

impl Trampoline {
    fn pop_frame_task(&self) -> Option<Task> {
        let mut frames = self.frames.borrow_mut();
        loop {
            let frame = frames.last_mut()?;
            let task = frame.pop_front();
            if frame.is_empty() {
                frames.pop();
            }
            if task.is_some() {
                return task;
            }
        }
    }
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with(|trampoline| {
            trampoline.draining.set(false);
            // Only non-empty after a panic unwound through a task.
            trampoline.frames.borrow_mut().clear();
        });
    }
}

/// Runs `task` after `delay` on the installed host.
pub(crate) fn defer_after(delay: Duration, task: Task) -> Disarm {
    let host = TRAMPOLINE.with(|trampoline| Rc::clone(&trampoline.host.borrow()));
    host.defer_after(delay, task)
}

/// Installs `host` for the current thread and returns the previous one.
pub fn set_host(host: Rc<dyn Host>) -> Rc<dyn Host> {
    tracing::debug!("installing scheduler host");
    TRAMPOLINE.with(|trampoline| trampoline.host.replace(host))
}

/// Restores the thread's default [`EventLoop`] as host.
pub fn reset_host() -> Rc<dyn Host> {
    set_host(event_loop())
}

/// The thread's default event loop.
pub fn event_loop() -> Rc<EventLoop> {
    EVENT_LOOP.with(Rc::clone)
}

/// Shorthand for `event_loop().run_until_idle()`.
pub fn run_until_idle() -> usize {
    event_loop().run_until_idle()
}

/// Deterministic single-thread host with a virtual clock.
///
/// Nothing runs until the loop is turned with [`run_until_idle`],
/// [`advance`] or [`run`]. Turning it from inside one of its own tasks is a
/// no-op returning 0.
///
/// [`run_until_idle`]: EventLoop::run_until_idle
/// [`advance`]: EventLoop::advance
/// [`run`]: EventLoop::run
#[derive(Default)]
pub struct EventLoop {
    ready: RefCell<VecDeque<Task>>,
    timers: RefCell<BinaryHeap<Timer>>,
    now: Cell<Duration>,
    sequence: Cell<u64>,
    running: Cell<bool>,
}

struct Timer {
    due: Duration,
    sequence: u64,
    disarmed: Rc<Cell<bool>>,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed: `BinaryHeap` is a max-heap and the earliest timer must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.sequence).cmp(&(self.due, self.sequence))
    }
}

impl Host for EventLoop {
    fn defer(&self, task: Task) {
        self.ready.borrow_mut().push_back(task);
    }

    fn defer_after(&self, delay: Duration, task: Task) -> Disarm {
        let sequence = self.sequence.get();
        self.sequence.set(sequence + 1);
        let disarmed = Rc::new(Cell::new(false));
        self.timers.borrow_mut().push(Timer {
            due: self.now.get().saturating_add(delay),
            sequence,
            disarmed: Rc::clone(&disarmed),
            task,
        });
        Box::new(move || disarmed.set(true))
    }
}

impl EventLoop {
    /// Virtual time elapsed since the loop was created.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    pub fn is_idle(&self) -> bool {
        self.ready.borrow().is_empty() && self.pending_timers() == 0
    }

    /// Timers still armed.
    pub fn pending_timers(&self) -> usize {
        self.timers
            .borrow()
            .iter()
            .filter(|timer| !timer.disarmed.get())
            .count()
    }

    /// Runs ready tasks, including ones they queue, until none remain.
    pub fn run_until_idle(&self) -> usize {
        self.turn(|| false, None)
    }

    /// Moves the clock forward by `by`, firing due timers in order.
    pub fn advance(&self, by: Duration) -> usize {
        let until = self.now.get().saturating_add(by);
        let ran = self.turn(|| false, Some(until));
        if self.now.get() < until {
            self.now.set(until);
        }
        ran
    }

    /// Runs until there is neither ready work nor a pending timer, jumping
    /// the clock from timer to timer.
    pub fn run(&self) -> usize {
        self.turn(|| false, Some(Duration::MAX))
    }

    /// Runs until `done` holds or the loop is idle. Returns `done()`.
    pub fn run_until(&self, done: impl Fn() -> bool) -> bool {
        self.turn(&done, Some(Duration::MAX));
        done()
    }

    fn turn(&self, done: impl Fn() -> bool, horizon: Option<Duration>) -> usize {
        if self.running.replace(true) {
            return 0;
        }
        let _running = ResetOnDrop(&self.running);
        let mut ran = 0;
        while !done() {
            let task = self.ready.borrow_mut().pop_front();
            if let Some(task) = task {
                task();
                ran += 1;
                continue;
            }
            let Some(horizon) = horizon else { break };
            let timer = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(timer) if timer.due <= horizon => timers.pop(),
                    _ => None,
                }
            };
            let Some(timer) = timer else { break };
            if timer.disarmed.get() {
                continue;
            }
            if timer.due > self.now.get() {
                self.now.set(timer.due);
            }
            (timer.task)();
            ran += 1;
        }
        ran
    }
}

struct ResetOnDrop<'a>(&'a Cell<bool>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &'static str| -> Task {
                let log = log.clone();
                Box::new(move || log.borrow_mut().push(name))
            }
        };
        (log, make)
    }

    #[test]
    fn test_next_turn_is_deferred_and_batched() {
        let (log, task) = recorder();
        next_turn(task("a"));
        next_turn(task("b"));
        assert!(log.borrow().is_empty());
        // One host callback drains the whole batch.
        assert_eq!(run_until_idle(), 1);
        assert_eq!(*log.borrow(), ["a", "b"]);
    }

    #[test]
    fn test_work_queued_during_flush_joins_the_batch() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = log.clone();
        next_turn(Box::new(move || {
            inner.borrow_mut().push(1);
            let inner = inner.clone();
            next_turn(Box::new(move || inner.borrow_mut().push(2)));
        }));
        assert_eq!(run_until_idle(), 1);
        assert_eq!(*log.borrow(), [1, 2]);
    }

    #[test]
    fn test_same_turn_frames_nest() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let outer_log = log.clone();
        let push = |log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str| -> Task {
            let log = log.clone();
            Box::new(move || log.borrow_mut().push(name))
        };
        let nested_frame = VecDeque::from([push(&log, "inner-1"), push(&log, "inner-2")]);
        let first: Task = Box::new(move || {
            outer_log.borrow_mut().push("outer-1");
            same_turn(nested_frame);
            outer_log.borrow_mut().push("outer-1-end");
        });
        same_turn(VecDeque::from([first, push(&log, "outer-2")]));
        assert_eq!(
            *log.borrow(),
            ["outer-1", "outer-1-end", "inner-1", "inner-2", "outer-2"]
        );
    }

    #[test]
    fn test_deep_same_turn_chain_does_not_recurse() {
        fn step(remaining: u32, count: Rc<Cell<u32>>) {
            count.set(count.get() + 1);
            if remaining > 0 {
                same_turn_one(Box::new(move || step(remaining - 1, count)));
            }
        }
        let count = Rc::new(Cell::new(0));
        let start = count.clone();
        same_turn_one(Box::new(move || step(200_000, start)));
        assert_eq!(count.get(), 200_001);
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let event_loop = EventLoop::default();
        let (log, task) = recorder();
        event_loop.defer_after(Duration::from_millis(20), task("late"));
        event_loop.defer_after(Duration::from_millis(10), task("early"));
        event_loop.defer_after(Duration::from_millis(10), task("early-2"));
        event_loop.advance(Duration::from_millis(15));
        assert_eq!(*log.borrow(), ["early", "early-2"]);
        assert_eq!(event_loop.now(), Duration::from_millis(15));
        event_loop.run();
        assert_eq!(*log.borrow(), ["early", "early-2", "late"]);
        assert_eq!(event_loop.now(), Duration::from_millis(20));
        assert!(event_loop.is_idle());
    }

    #[test]
    fn test_disarmed_timer_neither_fires_nor_moves_the_clock() {
        let event_loop = EventLoop::default();
        let (log, task) = recorder();
        event_loop.defer_after(Duration::from_millis(5), task("kept"));
        let disarm = event_loop.defer_after(Duration::from_secs(60), task("withdrawn"));
        assert_eq!(event_loop.pending_timers(), 2);
        disarm();
        assert_eq!(event_loop.pending_timers(), 1);
        event_loop.run();
        assert_eq!(*log.borrow(), ["kept"]);
        assert_eq!(event_loop.now(), Duration::from_millis(5));
        assert!(event_loop.is_idle());
    }

    #[test]
    fn test_batch_is_scheduled_again_after_a_panicking_task() {
        next_turn(Box::new(|| panic!("task failed")));
        let outcome = std::panic::catch_unwind(run_until_idle);
        assert!(outcome.is_err());
        let (log, task) = recorder();
        next_turn(task("after"));
        run_until_idle();
        assert_eq!(*log.borrow(), ["after"]);
    }

    #[test]
    fn test_nested_turn_is_noop() {
        let event_loop = Rc::new(EventLoop::default());
        let inner = event_loop.clone();
        let nested = Rc::new(Cell::new(usize::MAX));
        let seen = nested.clone();
        event_loop.defer(Box::new(move || seen.set(inner.run_until_idle())));
        assert_eq!(event_loop.run_until_idle(), 1);
        assert_eq!(nested.get(), 0);
    }
}
