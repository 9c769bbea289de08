//! End-to-end tests against an in-process mock daemon
//!
//! A `MockDaemon` accepts real TCP connections and answers request packets
//! through a per-test handler closure, which lets these tests drive the
//! full path: socket, receive loop, correlation, callback dispatch and
//! auto-reconnect.

use brickbus::packet;
use brickbus::{
    Connection, ConnectionState, Device, EnumerateEvent, EnumerationType, Error,
    ResponseExpectedFlag,
};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// (delay before sending, packet bytes)
type Response = (u64, Vec<u8>);
type Handler = Arc<dyn Fn(&[u8]) -> Vec<Response> + Send + Sync>;

struct MockDaemon {
    port: u16,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    accept_thread: Option<JoinHandle<()>>,
}

impl MockDaemon {
    fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_connections = Arc::clone(&connections);
        let accept_thread = thread::spawn(move || {
            let mut workers = Vec::new();

            while !accept_shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        accept_connections
                            .lock()
                            .unwrap()
                            .push(stream.try_clone().unwrap());
                        let handler = Arc::clone(&handler);
                        workers.push(thread::spawn(move || serve(stream, handler)));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }

            for worker in workers {
                let _ = worker.join();
            }
        });

        Self {
            port,
            shutdown,
            connections,
            accept_thread: Some(accept_thread),
        }
    }

    /// Hard-close every active connection, simulating a dying peer while
    /// the listener keeps accepting.
    fn close_connections(&self) {
        let mut connections = self.connections.lock().unwrap();
        for stream in connections.drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.close_connections();
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(stream: TcpStream, handler: Handler) {
    let writer = Arc::new(Mutex::new(stream.try_clone().unwrap()));
    let mut reader = stream;

    loop {
        let mut header = [0u8; 8];
        if reader.read_exact(&mut header).is_err() {
            break;
        }

        let length = header[4] as usize;
        let mut request = header.to_vec();
        if length > 8 {
            let mut payload = vec![0u8; length - 8];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }
            request.extend_from_slice(&payload);
        }

        for (delay_ms, bytes) in handler(&request) {
            let writer = Arc::clone(&writer);
            if delay_ms == 0 {
                let _ = writer.lock().unwrap().write_all(&bytes);
            } else {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(delay_ms));
                    let _ = writer.lock().unwrap().write_all(&bytes);
                });
            }
        }
    }
}

/// Build a response packet correlated to `request`, with the given error
/// code in the flags byte.
fn reply(request: &[u8], error_code: u8, payload: &[u8]) -> Vec<u8> {
    let length = (packet::HEADER_LEN + payload.len()) as u8;
    let mut response = packet::encode_header(
        length,
        packet::function_id(request),
        packet::uid(request),
        packet::sequence_number(request),
        false,
    )
    .to_vec();
    response[7] = error_code << 6;
    response.extend_from_slice(payload);
    response
}

/// Build an unsolicited enumerate callback packet for the given device.
fn enumerate_callback(uid: u32, uid_str: &str, enumeration_type: u8) -> Vec<u8> {
    let mut payload = [0u8; EnumerateEvent::PAYLOAD_LEN];
    payload[..uid_str.len()].copy_from_slice(uid_str.as_bytes());
    payload[8] = b'0';
    payload[16] = b'a';
    payload[17..20].copy_from_slice(&[1, 0, 0]);
    payload[20..23].copy_from_slice(&[2, 0, 1]);
    payload[23..25].copy_from_slice(&216u16.to_le_bytes());
    payload[25] = enumeration_type;

    let length = (packet::HEADER_LEN + payload.len()) as u8;
    let mut packet_bytes =
        packet::encode_header(length, packet::CALLBACK_ENUMERATE, uid, 0, false).to_vec();
    packet_bytes.extend_from_slice(&payload);
    packet_bytes
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const GETTER: u8 = 17;

fn echo_daemon() -> MockDaemon {
    MockDaemon::start(Arc::new(|request| {
        if packet::response_expected(request) {
            vec![(0, reply(request, 0, &[0x55]))]
        } else {
            Vec::new()
        }
    }))
}

fn getter_device(connection: &Connection, uid: &str) -> Device {
    let device = Device::new(connection, uid, None).unwrap();
    device.declare_function(GETTER, ResponseExpectedFlag::AlwaysTrue);
    device
}

#[test]
fn test_connect_disconnect_lifecycle() {
    init_logs();
    let daemon = echo_daemon();
    let connection = Connection::new();

    let (events_tx, events_rx) = mpsc::channel();
    let connected_tx = events_tx.clone();
    connection.add_connected_listener(move |reason| {
        connected_tx.send(format!("connected:{:?}", reason)).unwrap();
    });
    connection.add_disconnected_listener(move |reason| {
        events_tx.send(format!("disconnected:{:?}", reason)).unwrap();
    });

    connection.connect("127.0.0.1", daemon.port).unwrap();
    assert_eq!(connection.get_connection_state(), ConnectionState::Connected);
    assert_eq!(
        events_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        "connected:Request"
    );

    assert!(matches!(
        connection.connect("127.0.0.1", daemon.port),
        Err(Error::AlreadyConnected(_))
    ));

    connection.disconnect().unwrap();
    assert_eq!(
        connection.get_connection_state(),
        ConnectionState::Disconnected
    );
    assert_eq!(
        events_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        "disconnected:Request"
    );

    assert!(matches!(connection.disconnect(), Err(Error::NotConnected)));

    daemon.stop();
}

#[test]
fn test_request_round_trip_and_timeout_recovery() {
    init_logs();
    let muted = Arc::new(AtomicBool::new(true));
    let handler_muted = Arc::clone(&muted);
    let daemon = MockDaemon::start(Arc::new(move |request| {
        if handler_muted.load(Ordering::Relaxed) {
            Vec::new()
        } else {
            vec![(0, reply(request, 0, &[0x55]))]
        }
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);
    connection.set_timeout(Duration::from_millis(200));
    connection.connect("127.0.0.1", daemon.port).unwrap();

    let device = getter_device(&connection, "abc");

    // No response: the request must time out...
    assert!(matches!(
        device.request(GETTER, &[]),
        Err(Error::Timeout)
    ));

    // ...and leave the device usable: a subsequent request succeeds
    muted.store(false, Ordering::Relaxed);
    let response = device.request(GETTER, &[1, 2]).unwrap();
    assert_eq!(response, Some(vec![0x55]));

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_peer_error_codes_map_to_errors() {
    init_logs();
    // First payload byte of the request selects the response error code
    let daemon = MockDaemon::start(Arc::new(|request| {
        let error_code = packet::payload(request).first().copied().unwrap_or(0);
        vec![(0, reply(request, error_code, &[]))]
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);
    connection.connect("127.0.0.1", daemon.port).unwrap();

    let device = getter_device(&connection, "abc");

    assert!(device.request(GETTER, &[0]).is_ok());
    assert!(matches!(
        device.request(GETTER, &[1]),
        Err(Error::InvalidParameter { function_id: GETTER })
    ));
    assert!(matches!(
        device.request(GETTER, &[2]),
        Err(Error::NotSupported { function_id: GETTER })
    ));
    assert!(matches!(
        device.request(GETTER, &[3]),
        Err(Error::UnknownErrorCode {
            function_id: GETTER,
            error_code: 3
        })
    ));

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_orphaned_and_unknown_packets_are_dropped() {
    init_logs();
    let daemon = MockDaemon::start(Arc::new(|request| {
        // A packet for an unregistered uid, a response with a wrong
        // sequence number, then the real response
        let mut wrong_seq = reply(request, 0, &[0xEE]);
        let other_seq = (packet::sequence_number(request) % 15) + 1;
        wrong_seq[6] = other_seq << 4;

        let unknown_uid =
            packet::encode_header(8, packet::function_id(request), 0x7FFF_FFFF, 9, false).to_vec();

        vec![
            (0, unknown_uid),
            (0, wrong_seq),
            (0, reply(request, 0, &[0x55])),
        ]
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);
    connection.connect("127.0.0.1", daemon.port).unwrap();

    let device = getter_device(&connection, "abc");
    let response = device.request(GETTER, &[]).unwrap();
    assert_eq!(response, Some(vec![0x55]));

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_enumerate_callback_end_to_end() {
    init_logs();
    let uid = brickbus::base58::uid_from_base58("abc4").unwrap();
    let daemon = MockDaemon::start(Arc::new(move |request| {
        if packet::function_id(request) == packet::FUNCTION_ENUMERATE {
            vec![(0, enumerate_callback(uid, "abc4", 0))]
        } else {
            Vec::new()
        }
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);

    let (events_tx, events_rx) = mpsc::channel();
    connection.add_enumerate_listener(move |event: &EnumerateEvent| {
        events_tx.send(event.clone()).unwrap();
    });

    connection.connect("127.0.0.1", daemon.port).unwrap();
    connection.enumerate().unwrap();

    let event = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.uid, "abc4");
    assert_eq!(event.connected_uid, "0");
    assert_eq!(event.position, 'a');
    assert_eq!(event.hardware_version, [1, 0, 0]);
    assert_eq!(event.firmware_version, [2, 0, 1]);
    assert_eq!(event.device_identifier, 216);
    assert_eq!(event.enumeration_type, EnumerationType::Available);

    // Exactly one invocation
    thread::sleep(Duration::from_millis(200));
    assert!(events_rx.try_recv().is_err());

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_device_callback_dispatch() {
    init_logs();
    const CALLBACK: u8 = 42;

    let daemon = MockDaemon::start(Arc::new(|request| {
        // Answer any correlated request with an unsolicited callback first
        let uid = packet::uid(request);
        let mut callback =
            packet::encode_header(10, CALLBACK, uid, 0, false).to_vec();
        callback.extend_from_slice(&[7, 9]);

        vec![(0, callback), (0, reply(request, 0, &[]))]
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);
    connection.connect("127.0.0.1", daemon.port).unwrap();

    let device = getter_device(&connection, "abc");
    let (payload_tx, payload_rx) = mpsc::channel();
    device.register_callback(CALLBACK, move |payload| {
        payload_tx.send(payload.to_vec()).unwrap();
    });

    device.request(GETTER, &[]).unwrap();

    let payload = payload_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(payload, vec![7, 9]);

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_auto_reconnect_after_peer_close() {
    init_logs();
    let daemon = echo_daemon();
    let connection = Connection::new();

    let (events_tx, events_rx) = mpsc::channel();
    let connected_tx = events_tx.clone();
    connection.add_connected_listener(move |reason| {
        connected_tx.send(format!("connected:{:?}", reason)).unwrap();
    });
    connection.add_disconnected_listener(move |reason| {
        events_tx.send(format!("disconnected:{:?}", reason)).unwrap();
    });

    connection.connect("127.0.0.1", daemon.port).unwrap();
    assert_eq!(
        events_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        "connected:Request"
    );

    // Peer drops the connection; the caller never calls connect again
    daemon.close_connections();

    let disconnected = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(
        disconnected == "disconnected:Shutdown" || disconnected == "disconnected:Error",
        "unexpected event {:?}",
        disconnected
    );

    assert_eq!(
        events_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "connected:AutoReconnect"
    );
    assert_eq!(connection.get_connection_state(), ConnectionState::Connected);

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_concurrent_requests_do_not_serialize_across_devices() {
    init_logs();
    let slow_uid = brickbus::base58::uid_from_base58("abc").unwrap();
    let daemon = MockDaemon::start(Arc::new(move |request| {
        let delay = if packet::uid(request) == slow_uid { 400 } else { 0 };
        vec![(delay, reply(request, 0, &[]))]
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);
    connection.connect("127.0.0.1", daemon.port).unwrap();

    let slow_device = getter_device(&connection, "abc");
    let fast_device = getter_device(&connection, "abd");

    let slow_thread = thread::spawn(move || {
        let start = Instant::now();
        slow_device.request(GETTER, &[]).unwrap();
        start.elapsed()
    });

    // Give the slow request a head start so it is in flight
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    fast_device.request(GETTER, &[]).unwrap();
    let fast_elapsed = start.elapsed();

    let slow_elapsed = slow_thread.join().unwrap();

    assert!(
        fast_elapsed < Duration::from_millis(200),
        "fast request blocked for {:?}",
        fast_elapsed
    );
    assert!(slow_elapsed >= Duration::from_millis(300));

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_device_identifier_checked_lazily() {
    init_logs();
    const REPORTED: u16 = 99;

    let daemon = MockDaemon::start(Arc::new(|request| {
        if packet::function_id(request) == packet::FUNCTION_GET_IDENTITY {
            let mut identity = [0u8; 25];
            identity[0..3].copy_from_slice(b"abc");
            identity[8] = b'0';
            identity[16] = b'a';
            identity[23..25].copy_from_slice(&REPORTED.to_le_bytes());
            vec![(0, reply(request, 0, &identity))]
        } else {
            vec![(0, reply(request, 0, &[]))]
        }
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);
    connection.connect("127.0.0.1", daemon.port).unwrap();

    // Matching identifier: requests go through
    let matching = Device::new(&connection, "abc", Some(REPORTED)).unwrap();
    matching.declare_function(GETTER, ResponseExpectedFlag::AlwaysTrue);
    assert!(matching.request(GETTER, &[]).is_ok());
    assert_eq!(matching.get_identity().unwrap().device_identifier, REPORTED);

    // Mismatched identifier: every request fails, repeatedly
    let mismatched = Device::new(&connection, "abd", Some(13)).unwrap();
    mismatched.declare_function(GETTER, ResponseExpectedFlag::AlwaysTrue);
    for _ in 0..2 {
        assert!(matches!(
            mismatched.request(GETTER, &[]),
            Err(Error::WrongDeviceType {
                expected: 13,
                actual: REPORTED,
                ..
            })
        ));
    }

    connection.disconnect().unwrap();
    daemon.stop();
}

#[test]
fn test_authentication_handshake() {
    init_logs();
    const SERVER_NONCE: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
    const SECRET: &str = "My Authentication Secret!";

    let captured: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let handler_captured = Arc::clone(&captured);
    let daemon = MockDaemon::start(Arc::new(move |request| {
        match packet::function_id(request) {
            1 => vec![(0, reply(request, 0, &SERVER_NONCE))],
            2 => {
                *handler_captured.lock().unwrap() = Some(packet::payload(request).to_vec());
                vec![(0, reply(request, 0, &[]))]
            }
            _ => Vec::new(),
        }
    }));

    let connection = Connection::new();
    connection.set_auto_reconnect(false);
    connection.connect("127.0.0.1", daemon.port).unwrap();

    connection.authenticate(SECRET).unwrap();

    let payload = captured.lock().unwrap().clone().unwrap();
    assert_eq!(payload.len(), 24);

    let client_nonce = &payload[0..4];
    let digest = &payload[4..24];

    // Independently recompute the digest over server nonce + client nonce
    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha1::Sha1>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(&SERVER_NONCE);
    mac.update(client_nonce);
    let expected = mac.finalize().into_bytes();

    assert_eq!(digest, &expected[..]);

    connection.disconnect().unwrap();
    daemon.stop();
}
