mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopnet::{Buffer, InetAddress, PortReuse, TcpClient, TcpConnectionPtr, TcpServer};

#[test]
fn server_echoes_a_raw_tcp_client() {
    common::init();
    let (loop_, handle) = common::spawn_loop();
    let port = common::free_port();
    let addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
    let server = TcpServer::new(Arc::clone(&loop_), addr, "echo-server", PortReuse::Enabled);

    server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buf: &mut Buffer, _t| {
        let data = buf.retrieve_all_as_string();
        conn.send(&data);
    }));
    server.start(None);
    std::thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(b"hello, loopnet").unwrap();

    let mut buf = [0u8; 14];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello, loopnet");

    loop_.quit();
    handle.join().unwrap();
}

#[test]
fn client_and_server_exchange_data_end_to_end() {
    common::init();
    let (server_loop, server_handle) = common::spawn_loop();
    let (client_loop, client_handle) = common::spawn_loop();
    let port = common::free_port();
    let addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();

    let server = TcpServer::new(Arc::clone(&server_loop), addr, "roundtrip-server", PortReuse::Enabled);
    server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buf: &mut Buffer, _t| {
        let data = buf.retrieve_all_as_string();
        conn.send(&data);
    }));
    server.start(None);
    std::thread::sleep(Duration::from_millis(50));

    let client = TcpClient::new(Arc::clone(&client_loop), addr, "roundtrip-client");
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&received);
    client.set_message_callback(Arc::new(move |_conn: &TcpConnectionPtr, buf: &mut Buffer, _t| {
        r.lock().unwrap().extend_from_slice(&buf.retrieve_all_as_string());
    }));
    client.connect();
    std::thread::sleep(Duration::from_millis(100));

    let conn = client.connection().expect("client should be connected");
    conn.send(b"round trip");
    std::thread::sleep(Duration::from_millis(150));

    assert_eq!(*received.lock().unwrap(), b"round trip");

    client_loop.quit();
    client_handle.join().unwrap();
    server_loop.quit();
    server_handle.join().unwrap();
}

#[test]
fn large_write_past_high_water_mark_still_arrives_intact() {
    common::init();
    let (loop_, handle) = common::spawn_loop();
    let port = common::free_port();
    let addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
    let server = TcpServer::new(Arc::clone(&loop_), addr, "hwm-server", PortReuse::Enabled);

    let hwm_hit = Arc::new(AtomicBool::new(false));
    let h = Arc::clone(&hwm_hit);
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            let h = Arc::clone(&h);
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn: &TcpConnectionPtr, _bytes: usize| {
                    h.store(true, Ordering::SeqCst);
                }),
                1024,
            );
        }
    }));
    server.start(None);
    std::thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let payload = vec![0x5au8; 4 * 1024 * 1024];
    let writer = std::thread::spawn(move || {
        client.write_all(&payload).unwrap();
        client
    });

    std::thread::sleep(Duration::from_millis(200));
    assert!(hwm_hit.load(Ordering::SeqCst));

    let mut client = writer.join().unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    loop_.quit();
    handle.join().unwrap();
}

#[test]
fn client_retries_and_eventually_reaches_a_late_listener() {
    common::init();
    let port = common::free_port();
    let addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();

    let (client_loop, client_handle) = common::spawn_loop();
    let client = TcpClient::new(Arc::clone(&client_loop), addr, "retrying-client");
    client.enable_retry();

    let connected = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&connected);
    client.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            c.fetch_add(1, Ordering::SeqCst);
        }
    }));
    client.connect();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    let (server_loop, server_handle) = common::spawn_loop();
    let server = TcpServer::new(Arc::clone(&server_loop), addr, "late-server", PortReuse::Enabled);
    server.start(None);

    let start = std::time::Instant::now();
    while connected.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    client.stop();
    client_loop.quit();
    client_handle.join().unwrap();
    server_loop.quit();
    server_handle.join().unwrap();
}
