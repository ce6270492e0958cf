//! Schedules `Timer`s against a `timerfd`, firing due callbacks from the
//! owning `EventLoop`'s thread.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::Weak;

use crate::callbacks::TimerCallback;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::TimerFd;
use crate::timer::{Timer, TimerId};
use crate::timestamp::Timestamp;

type Entry = (Timestamp, i64);

pub(crate) struct TimerQueue {
    loop_: Weak<EventLoop>,
    timer_fd: TimerFd,
    channel: RefCell<Option<Arc<Channel>>>,
    by_expiry: RefCell<BTreeSet<Entry>>,
    by_identity: RefCell<HashMap<i64, Arc<Timer>>>,
    calling_expired_timers: std::cell::Cell<bool>,
    canceling_timers: RefCell<HashSet<i64>>,
}

// SAFETY: every field is mutated exclusively from the owning EventLoop's
// thread; `add_timer`/`cancel` are the only entry points callable from other
// threads and they immediately hop onto the loop via `run_in_loop`.
unsafe impl Send for TimerQueue {}
unsafe impl Sync for TimerQueue {}

impl TimerQueue {
    pub(crate) fn new(loop_: Weak<EventLoop>) -> io::Result<Arc<TimerQueue>> {
        let timer_fd = TimerFd::new()?;
        let channel = Channel::new(loop_.clone(), std::os::fd::AsRawFd::as_raw_fd(&timer_fd));

        let queue = Arc::new(TimerQueue {
            loop_,
            timer_fd,
            channel: RefCell::new(None),
            by_expiry: RefCell::new(BTreeSet::new()),
            by_identity: RefCell::new(HashMap::new()),
            calling_expired_timers: std::cell::Cell::new(false),
            canceling_timers: RefCell::new(HashSet::new()),
        });

        let weak_queue = Arc::downgrade(&queue);
        channel.set_read_callback(move |_receive_time| {
            if let Some(queue) = weak_queue.upgrade() {
                queue.handle_read();
            }
        });
        channel.enable_reading();
        *queue.channel.borrow_mut() = Some(channel);

        Ok(queue)
    }

    /// Thread safe: posts the actual insertion onto the owning loop.
    pub(crate) fn add_timer(
        self: &Arc<Self>,
        callback: TimerCallback,
        when: Timestamp,
        interval_micros: i64,
    ) -> TimerId {
        let timer = Arc::new(Timer::new(callback, when, interval_micros));
        let sequence = timer.sequence();
        let this = Arc::clone(self);
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.run_in_loop(move || this.add_timer_in_loop(timer));
        }
        TimerId::new(sequence)
    }

    pub(crate) fn cancel(self: &Arc<Self>, timer_id: TimerId) {
        let this = Arc::clone(self);
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.run_in_loop(move || this.cancel_in_loop(timer_id));
        }
    }

    fn add_timer_in_loop(&self, timer: Arc<Timer>) {
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            self.reset_timer_fd();
        }
    }

    fn cancel_in_loop(&self, timer_id: TimerId) {
        if let Some(timer) = self.by_identity.borrow_mut().remove(&timer_id.sequence) {
            self.by_expiry
                .borrow_mut()
                .remove(&(timer.expiration(), timer_id.sequence));
        } else if self.calling_expired_timers.get() {
            self.canceling_timers.borrow_mut().insert(timer_id.sequence);
        }
    }

    fn insert(&self, timer: Arc<Timer>) -> bool {
        let mut by_expiry = self.by_expiry.borrow_mut();
        let earliest_changed = by_expiry
            .iter()
            .next()
            .map(|(when, _)| timer.expiration() < *when)
            .unwrap_or(true);

        by_expiry.insert((timer.expiration(), timer.sequence()));
        self.by_identity
            .borrow_mut()
            .insert(timer.sequence(), timer);
        earliest_changed
    }

    fn handle_read(&self) {
        let now = Timestamp::now();
        let _ = self.timer_fd.drain();

        let expired = self.get_expired(now);

        self.calling_expired_timers.set(true);
        self.canceling_timers.borrow_mut().clear();
        for timer in &expired {
            timer.run();
        }
        self.calling_expired_timers.set(false);

        self.reset(expired, now);
    }

    fn get_expired(&self, now: Timestamp) -> Vec<Arc<Timer>> {
        let mut by_expiry = self.by_expiry.borrow_mut();
        let sentry = (now, i64::MAX);
        let due: Vec<Entry> = by_expiry.range(..sentry).copied().collect();

        let mut by_identity = self.by_identity.borrow_mut();
        let mut expired = Vec::with_capacity(due.len());
        for entry in due {
            by_expiry.remove(&entry);
            if let Some(timer) = by_identity.remove(&entry.1) {
                expired.push(timer);
            }
        }
        expired
    }

    fn reset(&self, expired: Vec<Arc<Timer>>, now: Timestamp) {
        for timer in expired {
            let still_wanted = timer.repeat() && !self.canceling_timers.borrow().contains(&timer.sequence());
            if still_wanted {
                timer.restart(now);
                self.insert(timer);
            }
        }

        let next_expiry = self
            .by_expiry
            .borrow()
            .iter()
            .next()
            .map(|(when, _)| *when);
        if let Some(when) = next_expiry {
            self.reset_timer_fd_to(when);
        }
    }

    fn reset_timer_fd(&self) {
        if let Some((when, _)) = self.by_expiry.borrow().iter().next() {
            self.reset_timer_fd_to(*when);
        }
    }

    fn reset_timer_fd_to(&self, when: Timestamp) {
        let micros = when.micros_since_epoch() - Timestamp::now().micros_since_epoch();
        if let Err(e) = self.timer_fd.arm(micros) {
            log::error!("timerfd_settime: {e}");
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
    }
}
