//! Runs an `EventLoop` on a dedicated OS thread, publishing the loop handle
//! back to the constructing thread once it's ready.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::event_loop::EventLoop;

pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

pub struct EventLoopThread {
    loop_: Mutex<Option<Arc<EventLoop>>>,
    cond: Condvar,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    init_callback: Option<ThreadInitCallback>,
    name: String,
}

impl EventLoopThread {
    pub fn new(init_callback: Option<ThreadInitCallback>, name: impl Into<String>) -> Arc<EventLoopThread> {
        Arc::new(EventLoopThread {
            loop_: Mutex::new(None),
            cond: Condvar::new(),
            join_handle: Mutex::new(None),
            init_callback,
            name: name.into(),
        })
    }

    /// Spawns the thread (once) and blocks until its `EventLoop` exists.
    pub fn start_loop(self: &Arc<Self>) -> Arc<EventLoop> {
        {
            let handle = self.join_handle.lock().unwrap();
            assert!(handle.is_none(), "EventLoopThread already started");
        }

        let this = Arc::clone(self);
        let builder = std::thread::Builder::new().name(self.name.clone());
        let handle = builder
            .spawn(move || this.thread_main())
            .expect("failed to spawn event loop thread");
        *self.join_handle.lock().unwrap() = Some(handle);

        let mut guard = self.loop_.lock().unwrap();
        while guard.is_none() {
            guard = self.cond.wait(guard).unwrap();
        }
        Arc::clone(guard.as_ref().unwrap())
    }

    fn thread_main(self: Arc<Self>) {
        let loop_ = EventLoop::new().expect("failed to create EventLoop");

        if let Some(cb) = &self.init_callback {
            cb(&loop_);
        }

        {
            let mut guard = self.loop_.lock().unwrap();
            *guard = Some(Arc::clone(&loop_));
            self.cond.notify_one();
        }

        loop_.run();

        *self.loop_.lock().unwrap() = None;
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(loop_) = self.loop_.lock().unwrap().clone() {
            loop_.quit();
        }
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_loop_runs_on_a_different_thread() {
        let thread = EventLoopThread::new(None, "test-elt");
        let loop_ = thread.start_loop();
        assert!(!loop_.is_in_loop_thread());
        drop(thread);
    }

    #[test]
    fn init_callback_runs_before_start_loop_returns() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let cb: ThreadInitCallback = Arc::new(move |_loop_| r.store(true, Ordering::SeqCst));

        let thread = EventLoopThread::new(Some(cb), "test-elt-init");
        let _loop_ = thread.start_loop();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic]
    fn start_loop_twice_panics() {
        let thread = EventLoopThread::new(None, "test-elt-twice");
        let _ = thread.start_loop();
        let _ = thread.start_loop();
    }
}
