//! A single scheduled callback, one-shot or repeating.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::callbacks::TimerCallback;
use crate::timestamp::Timestamp;

static NUM_CREATED: AtomicI64 = AtomicI64::new(0);

pub(crate) struct Timer {
    callback: RefCell<Option<TimerCallback>>,
    expiration: Cell<Timestamp>,
    interval_micros: i64,
    repeat: bool,
    sequence: i64,
}

// SAFETY: a Timer is constructed on whatever thread calls `add_timer` but
// handed to the owning EventLoop immediately via `run_in_loop`; every read
// of `callback`/`expiration` thereafter happens on that loop's thread.
unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    pub(crate) fn new(callback: TimerCallback, when: Timestamp, interval_micros: i64) -> Timer {
        Timer {
            callback: RefCell::new(Some(callback)),
            expiration: Cell::new(when),
            interval_micros,
            repeat: interval_micros > 0,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn run(&self) {
        if let Some(cb) = self.callback.borrow_mut().as_mut() {
            cb();
        }
    }

    pub(crate) fn expiration(&self) -> Timestamp {
        self.expiration.get()
    }

    pub(crate) fn repeat(&self) -> bool {
        self.repeat
    }

    pub(crate) fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Advances `expiration` by one interval past `now`, for a repeating
    /// timer that just fired.
    pub(crate) fn restart(&self, now: Timestamp) {
        if self.repeat {
            self.expiration.set(now.add_micros(self.interval_micros));
        } else {
            self.expiration.set(Timestamp::invalid());
        }
    }
}

/// An opaque handle to a scheduled timer, returned by `EventLoop::run_at`
/// and friends and accepted by `EventLoop::cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    pub(crate) sequence: i64,
}

impl TimerId {
    pub(crate) fn new(sequence: i64) -> TimerId {
        TimerId { sequence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_strictly_increasing() {
        let t1 = Timer::new(Box::new(|| {}), Timestamp::now(), 0);
        let t2 = Timer::new(Box::new(|| {}), Timestamp::now(), 0);
        assert!(t2.sequence() > t1.sequence());
    }

    #[test]
    fn one_shot_does_not_repeat() {
        let t = Timer::new(Box::new(|| {}), Timestamp::now(), 0);
        assert!(!t.repeat());
        t.restart(Timestamp::now());
        assert!(!t.expiration().valid());
    }

    #[test]
    fn repeating_advances_by_one_interval() {
        let t = Timer::new(Box::new(|| {}), Timestamp::now(), 1_000_000);
        assert!(t.repeat());
        let now = Timestamp::now();
        t.restart(now);
        assert_eq!(
            t.expiration().micros_since_epoch() - now.micros_since_epoch(),
            1_000_000
        );
    }

    #[test]
    fn run_invokes_callback_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let t = Timer::new(Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }), Timestamp::now(), 0);
        t.run();
        t.run();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
