//! End-to-end tests over loopback sockets
//!
//! Everything here runs the real client and server against each other (or
//! against a raw std socket standing in for a misbehaving peer) and drains
//! events with `tick`, exactly like an application would.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use msgpipe::config::{ClientConfig, ServerConfig};
use msgpipe::{Client, ConnectionId, Server};
use serial_test::serial;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connected(ConnectionId),
    Data(ConnectionId, Vec<u8>),
    Disconnected(ConnectionId),
}

type Log = Arc<Mutex<Vec<Event>>>;

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn server_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        ..ServerConfig::default()
    }
}

fn start_server(config: ServerConfig) -> (Server, u16) {
    let server = Server::new(config).unwrap();
    assert!(server.start(0));
    let port = server.local_addr().expect("bound").port();
    (server, port)
}

fn record_server(server: &Server) -> Log {
    let log: Log = Arc::default();
    let l = Arc::clone(&log);
    server.on_connected(move |id| l.lock().unwrap().push(Event::Connected(id)));
    let l = Arc::clone(&log);
    server.on_data(move |id, bytes| l.lock().unwrap().push(Event::Data(id, bytes.to_vec())));
    let l = Arc::clone(&log);
    server.on_disconnected(move |id| l.lock().unwrap().push(Event::Disconnected(id)));
    log
}

fn record_client(client: &Client) -> Log {
    let log: Log = Arc::default();
    let l = Arc::clone(&log);
    client.on_connected(move || l.lock().unwrap().push(Event::Connected(0)));
    let l = Arc::clone(&log);
    client.on_data(move |bytes| l.lock().unwrap().push(Event::Data(0, bytes.to_vec())));
    let l = Arc::clone(&log);
    client.on_disconnected(move || l.lock().unwrap().push(Event::Disconnected(0)));
    log
}

fn connect_client(config: ClientConfig, port: u16) -> (Client, Log) {
    let client = Client::new(config).unwrap();
    let log = record_client(&client);
    client.connect("127.0.0.1", port);
    assert!(wait_for(|| client.connected()), "client never connected");
    (client, log)
}

fn count(log: &Log, matches: impl Fn(&Event) -> bool) -> usize {
    log.lock().unwrap().iter().filter(|e| matches(e)).count()
}

#[test]
#[serial]
fn test_round_trip_and_disconnect() {
    let (server, port) = start_server(server_config());
    let server_log = record_server(&server);
    let (client, client_log) = connect_client(ClientConfig::default(), port);

    assert!(client.send(&[1, 2, 3]));
    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Data(..))) == 1
    }));

    let id = match server_log.lock().unwrap()[0] {
        Event::Connected(id) => id,
        ref other => panic!("expected Connected first, got {other:?}"),
    };
    assert_eq!(id, 1);
    assert_eq!(server_log.lock().unwrap()[1], Event::Data(id, vec![1, 2, 3]));
    assert_eq!(server.client_address(id), "127.0.0.1");
    assert_eq!(server.connection_count(), 1);

    assert!(server.send(id, &[4, 5]));
    assert!(wait_for(|| {
        client.tick(100, None);
        count(&client_log, |e| matches!(e, Event::Data(..))) == 1
    }));
    assert_eq!(
        *client_log.lock().unwrap(),
        vec![Event::Connected(0), Event::Data(0, vec![4, 5])]
    );

    client.disconnect();
    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Disconnected(..))) == 1
    }));
    assert_eq!(server_log.lock().unwrap().last(), Some(&Event::Disconnected(id)));
    assert!(wait_for(|| server.connection_count() == 0));

    assert!(wait_for(|| {
        client.tick(100, None);
        count(&client_log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));
    assert!(!client.connected());
    assert!(!client.send(&[1]));
}

#[test]
#[serial]
fn test_connect_to_dead_port() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = Client::new(ClientConfig::default()).unwrap();
    let log = record_client(&client);
    client.connect("127.0.0.1", port);

    assert!(wait_for(|| {
        client.tick(100, None);
        count(&log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));

    for _ in 0..10 {
        client.tick(100, None);
    }
    assert_eq!(*log.lock().unwrap(), vec![Event::Disconnected(0)]);
    assert!(!client.connected());
    assert!(!client.connecting());
    assert_eq!(client.metrics().snapshot().connect_failures, 1);
}

#[test]
#[serial]
fn test_unresolvable_host_reports_disconnect() {
    let client = Client::new(ClientConfig::default()).unwrap();
    let log = record_client(&client);
    client.connect("host.invalid", 7777);

    assert!(wait_for(|| {
        client.tick(100, None);
        count(&log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));
    assert_eq!(count(&log, |e| matches!(e, Event::Connected(_))), 0);
}

#[test]
#[serial]
fn test_message_size_limit_on_send() {
    let max = 1024;
    let mut config = server_config();
    config.transport.max_message_size = max;
    let (server, port) = start_server(config);
    let server_log = record_server(&server);

    let mut client_config = ClientConfig::default();
    client_config.transport.max_message_size = max;
    let (client, _client_log) = connect_client(client_config, port);

    assert!(client.send(&vec![7u8; max]));
    assert!(!client.send(&vec![7u8; max + 1]));
    assert!(client.connected());

    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Data(..))) == 1
    }));
    let log = server_log.lock().unwrap();
    let Event::Data(id, payload) = &log[1] else {
        panic!("expected data, got {:?}", log[1]);
    };
    assert_eq!(payload.len(), max);
    assert!(!server.send(*id, &vec![0u8; max + 1]));
    assert!(server.send(*id, &vec![0u8; max]));
}

#[test]
#[serial]
fn test_oversized_header_closes_connection() {
    let mut config = server_config();
    config.transport.max_message_size = 1024;
    let (server, port) = start_server(config);
    let server_log = record_server(&server);

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.write_all(&1025u32.to_be_bytes()).unwrap();

    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));
    assert_eq!(count(&server_log, |e| matches!(e, Event::Data(..))), 0);
    assert_eq!(server.metrics().snapshot().protocol_errors, 1);

    // the server dropped its end
    peer.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(peer.read(&mut buf), Ok(0) | Err(_)));
}

#[test]
#[serial]
fn test_frames_split_across_writes() {
    let (server, port) = start_server(server_config());
    let server_log = record_server(&server);

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.set_nodelay(true).unwrap();

    let mut stream = Vec::new();
    stream.extend_from_slice(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
    stream.extend_from_slice(&[0, 0, 0, 0]);
    stream.extend_from_slice(&[0, 0, 0, 2, 0xAB, 0xCD]);
    for piece in stream.chunks(3) {
        peer.write_all(piece).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Data(..))) == 3
    }));
    let data: Vec<Vec<u8>> = server_log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Data(_, bytes) => Some(bytes.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(data, vec![b"hello".to_vec(), vec![], vec![0xAB, 0xCD]]);
}

#[test]
#[serial]
fn test_wire_format_seen_by_raw_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(ClientConfig::default()).unwrap();
    client.connect("127.0.0.1", port);
    let (mut peer, _) = listener.accept().unwrap();
    assert!(wait_for(|| client.connected()));

    assert!(client.send(&[1, 2, 3]));
    assert!(client.send(&[]));

    let mut buf = [0u8; 11];
    peer.set_read_timeout(Some(WAIT)).unwrap();
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(buf, [0, 0, 0, 3, 1, 2, 3, 0, 0, 0, 0]);
}

#[test]
#[serial]
fn test_send_queue_limit_delivers_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = ClientConfig::default();
    config.transport.send_queue_limit = 4;
    config.transport.send_timeout = Duration::ZERO;
    let client = Client::new(config).unwrap();
    let log = record_client(&client);
    client.connect("127.0.0.1", port);

    // accepted but never read, so the socket buffers fill and the queue backs up
    let (_peer, _) = listener.accept().unwrap();
    assert!(wait_for(|| client.connected()));

    let payload = vec![0x5Au8; 16 * 1024];
    let mut sent = 0usize;
    while client.send(&payload) {
        sent += 1;
        assert!(sent < 1_000_000, "send queue limit never triggered");
    }
    assert!(sent >= 4);
    assert!(!client.connected());

    assert!(wait_for(|| {
        client.tick(100, None);
        count(&log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));
    for _ in 0..10 {
        client.tick(100, None);
    }
    assert_eq!(count(&log, |e| matches!(e, Event::Disconnected(_))), 1);
    assert!(!client.connected());
    assert_eq!(client.metrics().snapshot().queue_limit_disconnects, 1);
}

#[test]
#[serial]
fn test_stop_during_connect_burst_leaves_no_connections() {
    let server = Server::new(server_config()).unwrap();

    for round in 0..20u64 {
        assert!(server.start(0));
        let port = server.local_addr().unwrap().port();

        let burst = std::thread::spawn(move || {
            (0..50)
                .filter_map(|_| TcpStream::connect(("127.0.0.1", port)).ok())
                .collect::<Vec<_>>()
        });
        std::thread::sleep(Duration::from_micros(300 + round * 50));
        server.stop();
        let peers = burst.join().unwrap();

        assert_eq!(server.connection_count(), 0, "round {round}");
        // anything the listener was still accepting must not show up later
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(server.connection_count(), 0, "round {round}");
        drop(peers);
    }

    assert!(server.start(0));
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_invalid_client_config_is_rejected() {
    let mut config = ClientConfig::default();
    config.transport.max_message_size = 0;
    assert!(matches!(
        Client::new(config),
        Err(msgpipe::ProtocolError::ConfigError(_))
    ));
}

#[test]
#[serial]
fn test_tick_budget_preserves_order() {
    let (server, port) = start_server(server_config());
    let server_log = record_server(&server);
    let (client, _client_log) = connect_client(ClientConfig::default(), port);

    let total = 200u32;
    for i in 0..total {
        assert!(client.send(&i.to_be_bytes()));
    }
    // Connected plus every data message
    assert!(wait_for(|| server.receive_pipe_count() == total as usize + 1));

    let remaining = server.tick(1, None);
    assert_eq!(remaining, total as usize);
    assert_eq!(server_log.lock().unwrap().len(), 1);

    while server.tick(7, None) > 0 {}

    let received: Vec<u32> = server_log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Data(_, bytes) => Some(u32::from_be_bytes(bytes[..4].try_into().unwrap())),
            _ => None,
        })
        .collect();
    assert_eq!(received, (0..total).collect::<Vec<_>>());
}

#[test]
#[serial]
fn test_should_continue_stops_early() {
    let (server, port) = start_server(server_config());
    let server_log = record_server(&server);
    let (client, _client_log) = connect_client(ClientConfig::default(), port);

    assert!(client.send(b"a"));
    assert!(wait_for(|| server.receive_pipe_count() == 2));

    let stop: &dyn Fn() -> bool = &|| false;
    assert_eq!(server.tick(100, Some(stop)), 2);
    assert!(server_log.lock().unwrap().is_empty());

    let go: &dyn Fn() -> bool = &|| true;
    assert_eq!(server.tick(100, Some(go)), 0);
    assert_eq!(server_log.lock().unwrap().len(), 2);
}

#[test]
#[serial]
fn test_receive_queue_limit_disconnects() {
    let mut config = server_config();
    config.transport.receive_queue_limit = 5;
    let (server, port) = start_server(config);
    let server_log = record_server(&server);
    let (client, client_log) = connect_client(ClientConfig::default(), port);

    for i in 0..20u8 {
        client.send(&[i]);
    }

    // the server is not ticking, so its inbox fills and the connection drops
    assert!(wait_for(|| {
        client.tick(100, None);
        count(&client_log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));

    while server.tick(100, None) > 0 {}
    let log = server_log.lock().unwrap();
    assert!(matches!(log.first(), Some(Event::Connected(_))));
    assert!(matches!(log.last(), Some(Event::Disconnected(_))));
    assert_eq!(log.iter().filter(|e| matches!(e, Event::Data(..))).count(), 4);
    assert_eq!(server.metrics().snapshot().queue_limit_disconnects, 1);
}

#[test]
#[serial]
fn test_receive_timeout_drops_silent_peer() {
    let mut config = server_config();
    config.transport.receive_timeout = Duration::from_millis(100);
    let (server, port) = start_server(config);
    let server_log = record_server(&server);

    let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));
}

#[test]
#[serial]
fn test_server_disconnect_and_stop() {
    let (server, port) = start_server(server_config());
    let server_log = record_server(&server);
    let (client, client_log) = connect_client(ClientConfig::default(), port);

    assert!(wait_for(|| {
        server.tick(100, None);
        !server_log.lock().unwrap().is_empty()
    }));
    let Event::Connected(id) = server_log.lock().unwrap()[0] else {
        panic!("expected Connected");
    };

    assert!(server.disconnect(id));
    assert!(wait_for(|| {
        client.tick(100, None);
        count(&client_log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));
    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Disconnected(_))) == 1
    }));

    // ids keep counting up across reconnects
    client.connect("127.0.0.1", port);
    assert!(wait_for(|| {
        server.tick(100, None);
        count(&server_log, |e| matches!(e, Event::Connected(_))) == 2
    }));
    assert!(server_log
        .lock()
        .unwrap()
        .contains(&Event::Connected(id + 1)));

    server.stop();
    assert!(!server.active());
    assert!(wait_for(|| {
        client.tick(100, None);
        count(&client_log, |e| matches!(e, Event::Disconnected(_))) == 2
    }));
    assert!(!server.send(id + 1, b"gone"));

    assert!(server.start(0));
    assert!(server.active());
}

#[test]
#[serial]
fn test_second_connect_is_ignored() {
    let (server, port) = start_server(server_config());
    let client = Client::new(ClientConfig::default()).unwrap();
    client.connect("127.0.0.1", port);
    client.connect("127.0.0.1", port);

    assert!(wait_for(|| client.connected()));
    client.connect("127.0.0.1", port);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(server.connection_count(), 1);
}

#[test]
#[serial]
fn test_echo_from_inside_callback() {
    let server = Arc::new(Server::new(server_config()).unwrap());
    let weak = Arc::downgrade(&server);
    server.on_data(move |id, bytes| {
        if let Some(server) = weak.upgrade() {
            assert!(server.send(id, bytes));
        }
    });
    assert!(server.start(0));
    let port = server.local_addr().unwrap().port();

    let (client, client_log) = connect_client(ClientConfig::default(), port);
    assert!(client.send(b"ping"));

    assert!(wait_for(|| {
        server.tick(100, None);
        client.tick(100, None);
        count(&client_log, |e| matches!(e, Event::Data(..))) == 1
    }));
    assert!(client_log
        .lock()
        .unwrap()
        .contains(&Event::Data(0, b"ping".to_vec())));
}

#[test]
#[serial]
fn test_nested_tick_is_refused() {
    let server = Arc::new(Server::new(server_config()).unwrap());
    let weak = Arc::downgrade(&server);
    let seen: Arc<Mutex<Vec<(Vec<u8>, usize)>>> = Arc::default();
    let s = Arc::clone(&seen);
    server.on_data(move |_, bytes| {
        // the message being delivered is still queued, so depth is at least 1
        let depth = weak.upgrade().map(|server| server.tick(100, None)).unwrap_or(0);
        s.lock().unwrap().push((bytes.to_vec(), depth));
    });
    assert!(server.start(0));
    let port = server.local_addr().unwrap().port();

    let (client, _client_log) = connect_client(ClientConfig::default(), port);
    assert!(client.send(b"one"));
    assert!(client.send(b"two"));
    // Connected plus two data messages
    assert!(wait_for(|| server.receive_pipe_count() == 3));

    assert_eq!(server.tick(100, None), 0);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, b"one".to_vec());
    assert_eq!(seen[1].0, b"two".to_vec());
    assert!(seen.iter().all(|(_, depth)| *depth >= 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_shared_runtime() {
    let handle = tokio::runtime::Handle::current();
    let server = Server::with_runtime(server_config(), handle.clone()).unwrap();
    let server_log = record_server(&server);
    assert!(server.start(0));
    let port = server.local_addr().unwrap().port();

    let client = Client::with_runtime(ClientConfig::default(), handle).unwrap();
    client.connect("127.0.0.1", port);

    let deadline = Instant::now() + WAIT;
    while !client.connected() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.send(b"shared"));

    while count(&server_log, |e| matches!(e, Event::Data(..))) == 0 && Instant::now() < deadline {
        server.tick(100, None);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(count(&server_log, |e| matches!(e, Event::Data(..))), 1);
}
