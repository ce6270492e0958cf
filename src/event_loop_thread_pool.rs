//! A fixed-size pool of `EventLoopThread`s, handed out round-robin to
//! spread accepted connections across I/O threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: usize,
    next: AtomicUsize,
    threads: Vec<Arc<EventLoopThread>>,
    loops: Vec<Arc<EventLoop>>,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            num_threads: 0,
            next: AtomicUsize::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
            started: false,
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn start(&mut self, init_callback: Option<ThreadInitCallback>) {
        assert!(!self.started);
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let thread = EventLoopThread::new(init_callback.clone(), format!("{}{}", self.name, i));
            let loop_ = thread.start_loop();
            self.threads.push(thread);
            self.loops.push(loop_);
        }

        if self.num_threads == 0 {
            if let Some(cb) = init_callback {
                cb(&self.base_loop);
            }
        }
    }

    /// Round-robins through the pool; returns the base loop if the pool has
    /// no worker threads.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);

        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[index])
    }

    pub fn get_loop_for_hash(&self, hash_code: usize) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();

        if self.loops.is_empty() {
            Arc::clone(&self.base_loop)
        } else {
            Arc::clone(&self.loops[hash_code % self.loops.len()])
        }
    }

    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);

        if self.loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_always_returns_base_loop() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(Arc::clone(&base), "pool");
        pool.start(None);

        for _ in 0..3 {
            assert!(Arc::ptr_eq(&pool.get_next_loop(), &base));
        }
        assert_eq!(pool.get_all_loops().len(), 1);
    }

    #[test]
    fn multiple_threads_round_robin() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(Arc::clone(&base), "pool");
        pool.set_thread_num(3);
        pool.start(None);

        let picks: Vec<_> = (0..6).map(|_| pool.get_next_loop()).collect();
        assert!(!Arc::ptr_eq(&picks[0], &base));
        assert!(Arc::ptr_eq(&picks[0], &picks[3]));
        assert!(Arc::ptr_eq(&picks[1], &picks[4]));
        assert!(Arc::ptr_eq(&picks[2], &picks[5]));
        assert_eq!(pool.get_all_loops().len(), 3);
    }

    #[test]
    #[should_panic]
    fn start_twice_panics() {
        let base = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(base, "pool");
        pool.start(None);
        pool.start(None);
    }
}
