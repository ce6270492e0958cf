#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::{Arc, Once};

use loopnet::EventLoop;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn spawn_loop() -> (Arc<EventLoop>, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let loop_ = EventLoop::new().unwrap();
        tx.send(Arc::clone(&loop_)).unwrap();
        loop_.run();
    });
    (rx.recv().unwrap(), handle)
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
