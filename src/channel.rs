//! Per-descriptor event registration and demultiplexed callback dispatch.
//!
//! A `Channel` is only ever constructed, mutated and dropped on its owning
//! `EventLoop`'s thread (asserted at every mutating call); it is wrapped in
//! `Arc` purely so `EventLoop` — which is itself `Arc`-shared for
//! cross-thread task posting — can hold it in its descriptor map without a
//! second, thread-confined ownership model. See `EventLoop`'s doc comment
//! for the full affinity argument.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

pub const NONE_EVENT: i32 = 0;
pub const READ_EVENT: i32 = (libc::POLLIN | libc::POLLPRI) as i32;
pub const WRITE_EVENT: i32 = libc::POLLOUT as i32;

type ReadCallback = Box<dyn FnMut(Timestamp)>;
type EventCallback = Box<dyn FnMut()>;

/// A tie keeps a `Channel`'s owner alive across `handle_event`. It is type
/// erased because Acceptor/Connector/TcpConnection all tie different owner
/// types; only `upgrade().is_some()` is ever consulted.
pub type Tie = Weak<dyn Any + Send + Sync>;

pub struct Channel {
    loop_: Weak<EventLoop>,
    fd: RawFd,
    events: Cell<i32>,
    revents: Cell<i32>,
    index: Cell<i32>,
    tie: RefCell<Option<Tie>>,
    tied: Cell<bool>,
    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

// SAFETY: every field is mutated exclusively from the owning EventLoop's
// thread; every mutating path on EventLoop/Channel asserts that affinity at
// entry. No field is ever touched concurrently from two threads.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    /// `loop_` is a `Weak` rather than `&Arc<EventLoop>` so a channel can be
    /// built from inside `EventLoop`'s own `Arc::new_cyclic` constructor,
    /// before a strong reference to the owning loop exists.
    pub fn new(loop_: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            loop_,
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            index: Cell::new(-1),
            tie: RefCell::new(None),
            tied: Cell::new(false),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> i32 {
        self.events.get()
    }

    pub fn set_revents(&self, revents: i32) {
        self.revents.set(revents);
    }

    pub fn revents(&self) -> i32 {
        self.revents.get()
    }

    pub fn index(&self) -> i32 {
        self.index.get()
    }

    pub fn set_index(&self, idx: i32) {
        self.index.set(idx);
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + Send + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Ties this channel's callback execution to `owner`'s lifetime: if
    /// `owner` has been dropped by the time an event fires, the event is
    /// silently ignored instead of running against dangling state.
    pub fn tie(&self, owner: Tie) {
        *self.tie.borrow_mut() = Some(owner);
        self.tied.set(true);
    }

    pub(crate) fn mark_added_to_loop(&self, added: bool) {
        self.added_to_loop.set(added);
    }

    pub(crate) fn added_to_loop(&self) -> bool {
        self.added_to_loop.get()
    }

    fn update(self: &Arc<Self>) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.update_channel(self);
        }
    }

    pub fn remove(self: &Arc<Self>) {
        debug_assert!(self.is_none_event());
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.remove_channel(self);
        }
    }

    /// Dispatches on the received-event mask, per the fixed priority order:
    /// hangup-without-readable closes, error/invalid-fd errors, readable
    /// (including priority/peer-hangup-read) reads, writable writes.
    pub fn handle_event(self: &Arc<Self>, receive_time: Timestamp) {
        if self.tied.get() {
            let owner = self.tie.borrow().as_ref().and_then(|t| t.upgrade());
            if owner.is_none() {
                return;
            }
        }
        self.event_handling.set(true);
        self.handle_event_guarded(receive_time);
        self.event_handling.set(false);
    }

    fn handle_event_guarded(&self, receive_time: Timestamp) {
        let revents = self.revents.get();

        if (revents & libc::POLLHUP as i32) != 0 && (revents & libc::POLLIN as i32) == 0 {
            log::trace!("fd {} Channel::handle_event POLLHUP", self.fd);
            if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if (revents & (libc::POLLERR | libc::POLLNVAL) as i32) != 0 {
            if let Some(cb) = self.error_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if (revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as i32) != 0 {
            if let Some(cb) = self.read_callback.borrow_mut().as_mut() {
                cb(receive_time);
            }
        }

        if (revents & libc::POLLOUT as i32) != 0 {
            if let Some(cb) = self.write_callback.borrow_mut().as_mut() {
                cb();
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .field("index", &self.index.get())
            .finish()
    }
}
