//! The reactor: one loop per thread, built around a blocking `Poller::poll`
//! call and a deferred-task mailbox drained once per iteration.
//!
//! `EventLoop` must be created and run on the same OS thread — every
//! mutating method asserts that with [`EventLoop::assert_in_loop_thread`].
//! It is nonetheless `Arc`-shared, because callers on *other* threads still
//! need to post work onto it (`run_in_loop`/`queue_in_loop`) and `Channel`
//! needs a back-reference to its owner. The `unsafe impl Send + Sync` below
//! mirrors that: every interior-mutable field is only ever touched from the
//! owning thread, so the Rust-enforced `Sync` bound would be overly strict,
//! not incorrect to relax.

use std::cell::{Cell, RefCell};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use crate::callbacks::TimerCallback;
use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::EventFd;
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;
use crate::timestamp::Timestamp;

const POLL_TIME_MS: i32 = 10_000;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = const { RefCell::new(None) };
}

type Functor = Box<dyn FnOnce() + Send>;

pub struct EventLoop {
    looping: Cell<bool>,
    quit: AtomicBool,
    event_handling: Cell<bool>,
    calling_pending_functors: Cell<bool>,
    iteration: Cell<i64>,
    thread_id: ThreadId,
    poll_return_time: Cell<Timestamp>,
    poller: RefCell<Poller>,
    timer_queue: Arc<TimerQueue>,
    wakeup_fd: EventFd,
    wakeup_channel: Arc<Channel>,
    active_channels: RefCell<Vec<Arc<Channel>>>,
    current_active_channel: RefCell<Option<Arc<Channel>>>,
    pending_functors: Mutex<Vec<Functor>>,
}

// SAFETY: see module doc comment. Every Cell/RefCell field is read and
// written exclusively on `thread_id`'s thread; `pending_functors` is the one
// field genuinely shared across threads and it is a real `Mutex`.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    pub fn new() -> io::Result<Arc<EventLoop>> {
        crate::sys::ignore_sigpipe();

        if CURRENT_LOOP.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade).is_some()) {
            log::warn!("another EventLoop already exists in this thread");
        }

        let poller = Poller::new_default()?;
        let wakeup_fd = EventFd::new()?;

        let loop_ = Arc::new_cyclic(|weak_self: &Weak<EventLoop>| {
            let wakeup_channel = Channel::new(weak_self.clone(), std::os::fd::AsRawFd::as_raw_fd(&wakeup_fd));
            let timer_queue = TimerQueue::new(weak_self.clone())
                .unwrap_or_else(|e| panic!("failed to create timer queue: {e}"));

            EventLoop {
                looping: Cell::new(false),
                quit: AtomicBool::new(false),
                event_handling: Cell::new(false),
                calling_pending_functors: Cell::new(false),
                iteration: Cell::new(0),
                thread_id: std::thread::current().id(),
                poll_return_time: Cell::new(Timestamp::invalid()),
                poller: RefCell::new(poller),
                timer_queue,
                wakeup_fd,
                wakeup_channel,
                active_channels: RefCell::new(Vec::new()),
                current_active_channel: RefCell::new(None),
                pending_functors: Mutex::new(Vec::new()),
            }
        });

        log::debug!("EventLoop created in thread {:?}", loop_.thread_id);

        CURRENT_LOOP.with(|cell| *cell.borrow_mut() = Some(Arc::downgrade(&loop_)));

        let weak = Arc::downgrade(&loop_);
        loop_.wakeup_channel.set_read_callback(move |_time| {
            if let Some(loop_) = weak.upgrade() {
                loop_.handle_wakeup_read();
            }
        });
        loop_.wakeup_channel.enable_reading();

        Ok(loop_)
    }

    pub fn of_current_thread() -> Option<Arc<EventLoop>> {
        CURRENT_LOOP.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Runs the reactor until `quit` is called. Must run on the thread that
    /// constructed this loop.
    pub fn run(self: &Arc<Self>) {
        assert!(!self.looping.get());
        self.assert_in_loop_thread();
        self.looping.set(true);
        self.quit.store(false, Ordering::Release);
        log::trace!("EventLoop {:p} start looping", Arc::as_ptr(self));

        while !self.quit.load(Ordering::Acquire) {
            let mut active = Vec::new();
            let return_time = match self.poller.borrow_mut().poll(POLL_TIME_MS, &mut active) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("EventLoop::poll: {e}");
                    Timestamp::now()
                }
            };
            *self.active_channels.borrow_mut() = active;
            self.poll_return_time.set(return_time);
            self.iteration.set(self.iteration.get() + 1);

            self.event_handling.set(true);
            let channels = self.active_channels.borrow().clone();
            for channel in channels {
                *self.current_active_channel.borrow_mut() = Some(Arc::clone(&channel));
                channel.handle_event(return_time);
            }
            *self.current_active_channel.borrow_mut() = None;
            self.event_handling.set(false);

            self.do_pending_functors();
        }

        log::trace!("EventLoop {:p} stop looping", Arc::as_ptr(self));
        self.looping.set(false);
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    pub fn iteration(&self) -> i64 {
        self.iteration.get()
    }

    /// Runs `f` immediately if called from the loop thread, otherwise posts
    /// it to run at the start of the next iteration.
    pub fn run_in_loop(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Posts `f` to run once the current iteration's events have all been
    /// dispatched. Safe to call from any thread.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut functors = self.pending_functors.lock().unwrap();
            functors.push(Box::new(f));
        }
        if !self.is_in_loop_thread() || self.calling_pending_functors.get() {
            self.wakeup();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_functors.lock().unwrap().len()
    }

    pub fn run_at(self: &Arc<Self>, when: Timestamp, cb: TimerCallback) -> TimerId {
        self.timer_queue.add_timer(cb, when, 0)
    }

    pub fn run_after(self: &Arc<Self>, delay_seconds: f64, cb: TimerCallback) -> TimerId {
        let when = Timestamp::now().add_seconds(delay_seconds);
        self.run_at(when, cb)
    }

    pub fn run_every(self: &Arc<Self>, interval_seconds: f64, cb: TimerCallback) -> TimerId {
        let when = Timestamp::now().add_seconds(interval_seconds);
        let interval_micros = (interval_seconds * crate::timestamp::MICROSECONDS_PER_SECOND as f64) as i64;
        self.timer_queue.add_timer(cb, when, interval_micros)
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.timer_queue.cancel(timer_id);
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if self.event_handling.get() {
            let is_current = self
                .current_active_channel
                .borrow()
                .as_ref()
                .map(|c| Arc::ptr_eq(c, channel))
                .unwrap_or(false);
            let still_pending = self
                .active_channels
                .borrow()
                .iter()
                .any(|c| Arc::ptr_eq(c, channel));
            debug_assert!(is_current || !still_pending);
        }
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            self.abort_not_in_loop_thread();
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id == std::thread::current().id()
    }

    pub fn event_handling(&self) -> bool {
        self.event_handling.get()
    }

    fn abort_not_in_loop_thread(&self) {
        panic!(
            "EventLoop was created in thread {:?}, current thread is {:?}",
            self.thread_id,
            std::thread::current().id()
        );
    }

    fn wakeup(&self) {
        if let Err(e) = self.wakeup_fd.wake() {
            log::error!("EventLoop::wakeup: {e}");
        }
    }

    fn handle_wakeup_read(&self) {
        if let Err(e) = self.wakeup_fd.drain() {
            log::error!("EventLoop::handle_wakeup_read: {e}");
        }
    }

    fn do_pending_functors(&self) {
        let functors = {
            let mut guard = self.pending_functors.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        self.calling_pending_functors.set(true);
        for f in functors {
            f();
        }
        self.calling_pending_functors.set(false);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        log::debug!("EventLoop {:p} destructs in thread {:?}", self, std::thread::current().id());
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        CURRENT_LOOP.with(|cell| *cell.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn spawn_loop() -> (Arc<EventLoop>, std::thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let loop_ = EventLoop::new().unwrap();
            tx.send(Arc::clone(&loop_)).unwrap();
            loop_.run();
        });
        let loop_ = rx.recv().unwrap();
        (loop_, handle)
    }

    #[test]
    fn run_in_loop_from_other_thread_executes() {
        let (loop_, handle) = spawn_loop();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        loop_.run_in_loop(move || f.store(true, Ordering::SeqCst));

        std::thread::sleep(Duration::from_millis(100));
        assert!(flag.load(Ordering::SeqCst));

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn run_after_fires_timer() {
        let (loop_, handle) = spawn_loop();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        loop_.run_after(0.01, Box::new(move || f.store(true, Ordering::SeqCst)));

        std::thread::sleep(Duration::from_millis(150));
        assert!(flag.load(Ordering::SeqCst));

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn cancel_prevents_timer_from_firing() {
        let (loop_, handle) = spawn_loop();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        let id = loop_.run_after(0.05, Box::new(move || f.store(true, Ordering::SeqCst)));
        loop_.cancel(id);

        std::thread::sleep(Duration::from_millis(200));
        assert!(!flag.load(Ordering::SeqCst));

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn run_every_fires_more_than_once() {
        use std::sync::atomic::AtomicUsize;

        let (loop_, handle) = spawn_loop();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        loop_.run_every(0.01, Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));

        std::thread::sleep(Duration::from_millis(150));
        assert!(count.load(Ordering::SeqCst) >= 2);

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    #[should_panic]
    fn assert_in_loop_thread_panics_off_thread() {
        let loop_ = EventLoop::new().unwrap();
        let handle = std::thread::spawn(move || {
            loop_.assert_in_loop_thread();
        });
        handle.join().unwrap();
    }
}
