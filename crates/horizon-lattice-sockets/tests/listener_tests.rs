//! Tests for the listener and its accept stream.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use futures_util::StreamExt;
use horizon_lattice_sockets::{
    Event, Listener, ListenerConfig, RxSocket, SocketConfig, SocketError,
};

const WAIT: Duration = Duration::from_secs(5);

/// Subscribe to `listener` and forward every event to a channel.
fn accepted(listener: &Listener) -> mpsc::Receiver<Event<RxSocket>> {
    let (tx, rx) = mpsc::channel();
    listener.accept_observable().subscribe(move |event| {
        let _ = tx.send(event);
    });
    rx
}

fn next_socket(rx: &mpsc::Receiver<Event<RxSocket>>) -> RxSocket {
    match rx.recv_timeout(WAIT).expect("accept event") {
        Event::Next(socket) => socket,
        other => panic!("expected a connection, got {other:?}"),
    }
}

#[test]
fn test_negative_backlog_is_invalid() {
    let err = Listener::bind("127.0.0.1:0", -1).unwrap_err();
    assert!(matches!(err, SocketError::InvalidArgument(_)));
}

#[test]
fn test_bind_reports_ephemeral_port() {
    let listener = Listener::loopback(10).unwrap();
    assert_ne!(listener.local_addr().port(), 0);
    assert_eq!(listener.backlog(), 10);
    assert!(!listener.is_disposed());
    listener.dispose();
}

#[test]
fn test_bind_conflict() {
    let first = Listener::loopback(10).unwrap();
    let err = Listener::bind(first.local_addr(), 10).unwrap_err();

    match err {
        SocketError::Bind { addr, .. } => assert_eq!(addr, first.local_addr()),
        other => panic!("expected bind error, got {other:?}"),
    }
    first.dispose();
}

#[tokio::test]
async fn test_accepts_connections_in_order() {
    let listener = Listener::bind("127.0.0.1:0", 10).unwrap();
    let rx = accepted(&listener);

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = RxSocket::connect(listener.local_addr(), &SocketConfig::default())
            .await
            .unwrap();
        clients.push(client);
    }

    for client in &clients {
        let socket = next_socket(&rx);
        assert!(socket.is_connected());
        assert_eq!(socket.peer_addr(), client.local_addr());
        assert_eq!(socket.local_addr(), listener.local_addr());
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    listener.dispose();
    for client in &clients {
        client.dispose();
    }
}

#[tokio::test]
async fn test_welcome_message() {
    let listener = Listener::loopback(10).unwrap();
    listener.accept_observable().subscribe(|event| {
        if let Event::Next(socket) = event {
            socket.send_all(b"Welcome!").unwrap();
        }
    });

    let client = RxSocket::connect(listener.local_addr(), &SocketConfig::default())
        .await
        .unwrap();
    let mut incoming = client.receive_stream();
    let mut received = Vec::new();
    while received.len() < 8 {
        let chunk = tokio::time::timeout(WAIT, incoming.next())
            .await
            .expect("welcome in time")
            .expect("stream open")
            .expect("no fault");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"Welcome!");

    client.dispose();
    listener.dispose();
}

#[test]
fn test_dispose_completes_blocked_accept() {
    let listener = Listener::loopback(10).unwrap();
    let rx = accepted(&listener);

    // Let the accept thread block.
    thread::sleep(Duration::from_millis(50));
    listener.dispose();

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Completed));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(listener.is_disposed());
}

#[test]
fn test_dispose_before_any_consumer() {
    let listener = Listener::loopback(10).unwrap();
    listener.dispose();

    let rx = accepted(&listener);
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Completed));
    assert!(listener.accept_observable().is_terminated());
}

#[test]
fn test_attach_racing_dispose_completes() {
    for _ in 0..20 {
        let listener = Listener::loopback(10).unwrap();
        let attacher = {
            let listener = listener.clone();
            thread::spawn(move || accepted(&listener))
        };
        listener.dispose();

        let rx = attacher.join().unwrap();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Completed));
    }
}

#[test]
fn test_dispose_is_idempotent_across_threads() {
    let listener = Listener::loopback(10).unwrap();
    let completions = Arc::new(AtomicUsize::new(0));
    {
        let completions = completions.clone();
        listener.accept_observable().subscribe(move |event| {
            if event.is_terminal() {
                completions.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let listener = listener.clone();
            thread::spawn(move || listener.dispose())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    listener.dispose();

    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_accepted_connections_outlive_listener() {
    let listener = Listener::loopback(10).unwrap();
    let rx = accepted(&listener);

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    let socket = next_socket(&rx);
    listener.dispose();

    assert!(socket.is_connected());
    socket.send_all(b"still here").unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"still here");
    socket.dispose();
}

#[test]
fn test_dispose_from_accept_callback() {
    let listener = Listener::loopback(10).unwrap();
    let (tx, rx) = mpsc::channel();
    {
        let listener = listener.clone();
        listener.clone().accept_observable().subscribe(move |event| {
            match event {
                Event::Next(socket) => {
                    socket.dispose();
                    listener.dispose();
                }
                terminal => {
                    let _ = tx.send(terminal);
                }
            }
        });
    }

    let _client = TcpStream::connect(listener.local_addr()).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Completed));
    assert!(listener.is_disposed());
}

#[test]
fn test_no_connections_after_dispose() {
    let listener = Listener::loopback(10).unwrap();
    let addr = listener.local_addr();
    let rx = accepted(&listener);
    listener.dispose();

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Completed));
    assert!(TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_err());
}

#[tokio::test]
async fn test_accept_stream_pull() {
    let listener = Listener::with_config(ListenerConfig::loopback().backlog(4)).unwrap();
    let mut stream = listener.accept_stream();

    let _client = TcpStream::connect(listener.local_addr()).unwrap();
    let socket = tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("accept in time")
        .expect("stream open")
        .expect("no fault");
    assert!(socket.is_connected());

    listener.dispose_async().await;
    let end = tokio::time::timeout(WAIT, stream.next()).await.unwrap();
    assert!(end.is_none());
}
