mod common;

use netcore::{
    ConnectionCallbacks, ConnectionState, Error, ErrorKind, Executor, SocketConfig, SyncTcpClient,
    TcpClient, TcpServer,
};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn echo_server(executor: &Executor, closes: Arc<AtomicUsize>) -> TcpServer {
    let callbacks = ConnectionCallbacks::new()
        .on_data(|connection, data| {
            let _ = connection.send(data.to_vec());
        })
        .on_close(move |_, error| {
            if error.is_none() {
                closes.fetch_add(1, Ordering::SeqCst);
            }
        });
    TcpServer::bind(executor.handle(), common::localhost(), SocketConfig::default(), callbacks)
        .expect("bind server")
}

#[test]
fn echo_preserves_write_order() {
    common::init_tracing();
    let executor = Executor::new("tcp-echo", 2).expect("executor");
    let server_closes = Arc::new(AtomicUsize::new(0));
    let server = echo_server(&executor, server_closes.clone());

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let callbacks = ConnectionCallbacks::new().on_data(move |_, data| sink.lock().extend_from_slice(data));

    let client = executor
        .block_on(TcpClient::connect(
            executor.handle(),
            server.local_addr(),
            SocketConfig::default(),
            callbacks,
        ))
        .expect("block_on")
        .expect("connect");
    assert_eq!(client.state(), ConnectionState::Open);

    for chunk in ["one ", "two ", "three"] {
        client.send(chunk).expect("send");
    }
    assert!(common::wait_until(Duration::from_secs(3), || {
        received.lock().as_slice() == b"one two three"
    }));

    assert!(common::wait_until(Duration::from_secs(1), || server.connection_count() == 1));
    client.close();
    assert!(common::wait_until(Duration::from_secs(3), || {
        server_closes.load(Ordering::SeqCst) == 1 && server.connection_count() == 0
    }));
    assert!(matches!(client.send("late"), Err(Error::Closed)));
}

#[test]
fn close_callback_fires_exactly_once() {
    let executor = Executor::new("tcp-close", 2).expect("executor");
    let server = echo_server(&executor, Arc::new(AtomicUsize::new(0)));

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    let callbacks = ConnectionCallbacks::new().on_close(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let client = executor
        .block_on(TcpClient::connect(
            executor.handle(),
            server.local_addr(),
            SocketConfig::default(),
            callbacks,
        ))
        .expect("block_on")
        .expect("connect");

    client.close();
    client.close();
    server.stop();

    assert!(common::wait_until(Duration::from_secs(3), || client.state() == ConnectionState::Closed));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn broadcast_reaches_every_connection() {
    let executor = Executor::new("tcp-broadcast", 2).expect("executor");
    let server = echo_server(&executor, Arc::new(AtomicUsize::new(0)));

    let mut peers = Vec::new();
    for _ in 0..3 {
        let mut stream = std::net::TcpStream::connect(server.local_addr()).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(3))).expect("timeout");
        stream.write_all(b"x").expect("write");
        let mut echo = [0u8; 1];
        stream.read_exact(&mut echo).expect("echo");
        peers.push(stream);
    }

    assert!(common::wait_until(Duration::from_secs(2), || server.connection_count() == 3));
    assert_eq!(server.broadcast(b"news"), 3);

    for mut peer in peers {
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).expect("broadcast");
        assert_eq!(&buf, b"news");
    }
}

#[test]
fn connection_opening_during_stop_is_closed_not_tracked() {
    let executor = Executor::new("tcp-stop-race", 3).expect("executor");
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let closes = Arc::new(AtomicUsize::new(0));

    let (entered_open, release_open, close_count) = (entered.clone(), release.clone(), closes.clone());
    let callbacks = ConnectionCallbacks::new()
        .on_open(move |_| {
            // Hold the accept path open until the server has been stopped.
            entered_open.wait();
            release_open.wait();
        })
        .on_close(move |_, _| {
            close_count.fetch_add(1, Ordering::SeqCst);
        });
    let server = TcpServer::bind(executor.handle(), common::localhost(), SocketConfig::default(), callbacks)
        .expect("bind server");

    let mut peer = std::net::TcpStream::connect(server.local_addr()).expect("connect");
    peer.set_read_timeout(Some(Duration::from_secs(3))).expect("timeout");

    entered.wait();
    server.stop();
    release.wait();

    let mut buf = [0u8; 8];
    assert_eq!(peer.read(&mut buf).expect("eof"), 0);
    assert!(common::wait_until(Duration::from_secs(3), || closes.load(Ordering::SeqCst) == 1));
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn connect_failure_is_a_transport_error() {
    let executor = Executor::new("tcp-refused", 1).expect("executor");
    let port = TcpListener::bind("127.0.0.1:0").expect("bind").local_addr().expect("addr");

    let result = executor
        .block_on(TcpClient::connect(
            executor.handle(),
            port,
            SocketConfig::default(),
            ConnectionCallbacks::new(),
        ))
        .expect("block_on");
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.raw_os_error().is_some());
}

#[test]
fn sync_recv_returns_bytes_before_the_deadline() {
    common::init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream.write_all(b"hello").expect("write");
        let mut ack = [0u8; 3];
        stream.read_exact(&mut ack).expect("ack");
        ack
    });

    let mut client = SyncTcpClient::new().expect("client");
    client.connect(addr).expect("connect");

    let started = Instant::now();
    let mut buf = [0u8; 16];
    let mut got = 0;
    while got < 5 {
        got += client.recv(&mut buf[got..], Duration::from_secs(3)).expect("recv");
    }
    assert_eq!(&buf[..got], b"hello");
    assert!(started.elapsed() < Duration::from_secs(3));

    client.send(b"ack", Duration::from_secs(3)).expect("send");
    assert_eq!(&peer.join().expect("peer"), b"ack");
}

#[test]
fn sync_recv_times_out_without_data() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let peer = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    let mut client = SyncTcpClient::new().expect("client");
    client.connect(addr).expect("connect");

    let started = Instant::now();
    let mut buf = [0u8; 8];
    let err = client.recv(&mut buf, Duration::from_millis(100)).unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(300));

    peer.join().expect("peer");
}
