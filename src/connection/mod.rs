//! Connection management for the brick daemon protocol
//!
//! This module owns the TCP session and the three long-lived threads that
//! serve it:
//!
//! 1. **Receive Loop** (`receiver`): owns the read side of the socket,
//!    slices complete packets out of the byte stream and routes them to a
//!    device's response slot or the callback queue.
//! 2. **Disconnect Prober** (`prober`): sends a no-op probe request when the
//!    connection has been idle for a full interval; a failed send is treated
//!    as a peer disconnect.
//! 3. **Callback Dispatcher** (`dispatcher`): single consumer of the
//!    callback queue; serializes delivery of meta-events and device
//!    callbacks to user listeners and runs the auto-reconnect retry loop.
//!
//! # Lock hierarchy
//!
//! socket-state lock → send lock → sequence-number lock, never nested in
//! reverse. The device request mutex is independent and never held across a
//! socket-state acquisition. The receive loop never acquires the
//! socket-state lock; it hands teardown over via the callback queue, which
//! is always safe to push to.
//!
//! # Socket generations
//!
//! Every established socket gets a monotonically increasing generation id.
//! Teardown signals carry the generation they belong to, so a stale signal
//! from a superseded connection is ignored.

mod dispatcher;
mod prober;
mod receiver;

use crate::device::{self, DeviceInner, ResponseExpectedFlag};
use crate::error::{Error, Result};
use crate::packet::{
    self, EnumerateEvent, BROADCAST_UID, FUNCTION_DISCONNECT_PROBE, FUNCTION_ENUMERATE, HEADER_LEN,
};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default response timeout for correlated requests
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2500);

/// UID of the daemon's own device endpoint (Base58 "2")
const DAEMON_UID: u32 = 1;

/// Daemon function returning the 4-byte server nonce
const FUNCTION_GET_AUTHENTICATION_NONCE: u8 = 1;

/// Daemon function accepting client nonce and HMAC-SHA1 digest
const FUNCTION_AUTHENTICATE: u8 = 2;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection is established
    Disconnected,
    /// A connection to the daemon is established
    Connected,
    /// Connection lost, auto-reconnect in progress
    Pending,
}

/// Why a connected meta-event fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// Explicit `connect` call
    Request,
    /// Auto-reconnect re-established a lost connection
    AutoReconnect,
}

/// Why a disconnected meta-event fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit `disconnect` call
    Request,
    /// Read or write on the socket failed
    Error,
    /// Peer closed the connection
    Shutdown,
}

/// Entry in the callback queue, consumed by the dispatcher thread
pub(crate) enum QueueItem {
    /// Terminate the dispatcher
    Exit,
    /// Connection established
    Connected(ConnectReason),
    /// Connection lost; the generation tags which socket the event is for
    Disconnected(DisconnectReason, u64),
    /// Raw callback packet for device or enumerate listeners
    Packet(Vec<u8>),
}

/// Token returned by listener registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ConnectedListener = Arc<Mutex<Box<dyn FnMut(ConnectReason) + Send>>>;
type DisconnectedListener = Arc<Mutex<Box<dyn FnMut(DisconnectReason) + Send>>>;
type EnumerateListener = Arc<Mutex<Box<dyn FnMut(&EnumerateEvent) + Send>>>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    connected: Vec<(ListenerId, ConnectedListener)>,
    disconnected: Vec<(ListenerId, DisconnectedListener)>,
    enumerate: Vec<(ListenerId, EnumerateListener)>,
}

/// Socket and per-generation thread handles, guarded by the socket-state
/// lock
struct SocketState {
    stream: Option<TcpStream>,
    socket_id: u64,
    host: String,
    port: u16,
    receiver: Option<JoinHandle<()>>,
    prober: Option<prober::Prober>,
}

/// Shared connection state behind the public [`Connection`] handle
pub(crate) struct ConnectionInner {
    socket: Mutex<SocketState>,
    /// Write half of the socket; separate lock so sends and disconnect
    /// probes don't contend with connect/disconnect
    send: Mutex<Option<TcpStream>>,
    sequence_number: Mutex<u8>,
    /// Next client nonce for the authentication handshake, 0 = unseeded
    authentication_nonce: Mutex<u64>,
    devices: Mutex<HashMap<u32, Weak<DeviceInner>>>,
    dispatcher: Mutex<Option<dispatcher::Dispatcher>>,
    listeners: Mutex<Listeners>,
    /// Cleared before the receive loop is torn down, set after a new one
    /// starts; gates packet callback delivery
    dispatch_allowed: AtomicBool,
    /// Receive loop runs while set; cleared on caller-requested teardown
    receive_flag: AtomicBool,
    /// True when no traffic has been observed since the prober's last tick
    idle_flag: AtomicBool,
    /// User toggle for auto-reconnect
    auto_reconnect: AtomicBool,
    /// Set once a connection was lost after being fully established,
    /// cleared by an explicit `disconnect`; prevents a doomed reconnect
    /// loop right after the user's own disconnect
    auto_reconnect_allowed: AtomicBool,
    auto_reconnect_pending: AtomicBool,
    response_timeout_ms: AtomicU64,
}

impl ConnectionInner {
    /// Allocate the next sequence number, cycling 1..=15; 0 is reserved
    /// for unsolicited callbacks.
    fn next_sequence_number(&self) -> u8 {
        let mut sequence_number = self.sequence_number.lock();
        *sequence_number = (*sequence_number % 15) + 1;
        *sequence_number
    }

    /// Build a request header with a freshly allocated sequence number;
    /// the caller appends the payload.
    pub(crate) fn create_request(
        &self,
        uid: u32,
        length: u8,
        function_id: u8,
        response_expected: bool,
    ) -> (Vec<u8>, u8) {
        let sequence_number = self.next_sequence_number();
        let mut request = Vec::with_capacity(length as usize);
        request.extend_from_slice(&packet::encode_header(
            length,
            function_id,
            uid,
            sequence_number,
            response_expected,
        ));

        (request, sequence_number)
    }

    /// Write a request to the socket. A failed write is converted to an
    /// immediate teardown plus a Disconnected meta-event.
    pub(crate) fn send_request(&self, request: &[u8]) -> Result<()> {
        let mut socket = self.socket.lock();

        if socket.stream.is_none() {
            return Err(Error::NotConnected);
        }

        let write_result = {
            let mut send = self.send.lock();
            match send.as_mut() {
                Some(stream) => stream.write_all(request),
                None => return Err(Error::NotConnected),
            }
        };

        if let Err(e) = write_result {
            log::warn!("Connection: send failed, treating as peer disconnect: {}", e);
            self.auto_reconnect_allowed.store(true, Ordering::Relaxed);
            self.disconnect_locked(&mut socket);
            self.enqueue(QueueItem::Disconnected(DisconnectReason::Error, 0));
            return Err(Error::NotConnected);
        }

        self.idle_flag.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Tear down prober, receive loop and socket, in that order. Assumes
    /// the socket-state lock is held. Safe to call with a partially
    /// started session.
    fn disconnect_locked(&self, socket: &mut SocketState) {
        if let Some(prober) = socket.prober.take() {
            prober.shutdown();
        }

        // Stop dispatching packet callbacks before ending the receive loop,
        // otherwise a callback handler could block on a getter whose
        // response can never arrive
        self.dispatch_allowed.store(false, Ordering::Relaxed);
        self.receive_flag.store(false, Ordering::Relaxed);

        self.close_socket_locked(socket);

        if let Some(receiver) = socket.receiver.take() {
            let _ = receiver.join();
        }
    }

    /// Close the socket and drop the send half. Assumes the socket-state
    /// lock is held.
    fn close_socket_locked(&self, socket: &mut SocketState) {
        *self.send.lock() = None;

        if let Some(stream) = socket.stream.take() {
            // Unblocks the receive loop's read on the cloned handle
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Signal a peer-initiated disconnect from the receive loop or prober.
    /// Must not touch the socket-state lock; the dispatcher performs the
    /// actual teardown.
    fn handle_disconnect_by_peer(&self, reason: DisconnectReason, socket_id: u64) {
        self.auto_reconnect_allowed.store(true, Ordering::Relaxed);
        self.enqueue(QueueItem::Disconnected(reason, socket_id));
    }

    fn enqueue(&self, item: QueueItem) {
        let guard = self.dispatcher.lock();
        if let Some(dispatcher) = guard.as_ref() {
            dispatcher.send(item);
        }
    }

    fn device(&self, uid: u32) -> Option<Arc<DeviceInner>> {
        self.devices.lock().get(&uid).and_then(Weak::upgrade)
    }

    fn has_enumerate_listeners(&self) -> bool {
        !self.listeners.lock().enumerate.is_empty()
    }

    fn call_connected_listeners(&self, reason: ConnectReason) {
        let listeners: Vec<ConnectedListener> = {
            let guard = self.listeners.lock();
            guard.connected.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in listeners {
            let mut listener = listener.lock();
            (*listener)(reason);
        }
    }

    fn call_disconnected_listeners(&self, reason: DisconnectReason) {
        let listeners: Vec<DisconnectedListener> = {
            let guard = self.listeners.lock();
            guard
                .disconnected
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect()
        };

        for listener in listeners {
            let mut listener = listener.lock();
            (*listener)(reason);
        }
    }

    fn call_enumerate_listeners(&self, event: &EnumerateEvent) {
        let listeners: Vec<EnumerateListener> = {
            let guard = self.listeners.lock();
            guard.enumerate.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in listeners {
            let mut listener = listener.lock();
            (*listener)(event);
        }
    }
}

/// Open the socket and start the per-generation threads. Assumes the
/// socket-state lock is held and no socket is present.
fn connect_locked(
    inner: &Arc<ConnectionInner>,
    socket: &mut SocketState,
    reason: ConnectReason,
) -> Result<()> {
    ensure_dispatcher(inner)?;

    let result = start_session(inner, socket, reason);
    if result.is_err() {
        // Partial start; tears down whatever came up
        inner.disconnect_locked(socket);
    }

    result
}

fn start_session(
    inner: &Arc<ConnectionInner>,
    socket: &mut SocketState,
    reason: ConnectReason,
) -> Result<()> {
    let stream = TcpStream::connect((socket.host.as_str(), socket.port))?;
    stream.set_nodelay(true)?;
    let send_half = stream.try_clone()?;
    let receive_half = stream.try_clone()?;

    socket.socket_id += 1;
    let socket_id = socket.socket_id;
    *inner.send.lock() = Some(send_half);

    inner.idle_flag.store(true, Ordering::Relaxed);
    let (probe_request, _) = inner.create_request(
        BROADCAST_UID,
        HEADER_LEN as u8,
        FUNCTION_DISCONNECT_PROBE,
        false,
    );
    socket.prober = Some(prober::Prober::spawn(
        Arc::clone(inner),
        probe_request,
        socket_id,
    )?);

    inner.dispatch_allowed.store(true, Ordering::Relaxed);
    inner.receive_flag.store(true, Ordering::Relaxed);
    socket.receiver = Some(receiver::spawn(Arc::clone(inner), receive_half, socket_id)?);
    socket.stream = Some(stream);

    inner.auto_reconnect_allowed.store(false, Ordering::Relaxed);
    inner.auto_reconnect_pending.store(false, Ordering::Relaxed);

    inner.enqueue(QueueItem::Connected(reason));
    log::info!(
        "Connection: connected to {}:{} (socket generation {})",
        socket.host,
        socket.port,
        socket_id
    );

    Ok(())
}

fn ensure_dispatcher(inner: &Arc<ConnectionInner>) -> Result<()> {
    let mut guard = inner.dispatcher.lock();
    if guard.is_none() {
        *guard = Some(dispatcher::Dispatcher::spawn(Arc::clone(inner))?);
    }

    Ok(())
}

/// Connection to a brick daemon
///
/// Cloning yields another handle to the same connection; device handles
/// keep their own clone. The connection does not tear itself down on drop,
/// call [`Connection::disconnect`] to end the session and its threads.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
    /// Daemon's own device endpoint, used by the authentication handshake
    daemon: Arc<DeviceInner>,
}

impl Connection {
    /// Create an unconnected connection.
    pub fn new() -> Self {
        let inner = Arc::new(ConnectionInner {
            socket: Mutex::new(SocketState {
                stream: None,
                socket_id: 0,
                host: String::new(),
                port: 0,
                receiver: None,
                prober: None,
            }),
            send: Mutex::new(None),
            sequence_number: Mutex::new(0),
            authentication_nonce: Mutex::new(0),
            devices: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
            listeners: Mutex::new(Listeners::default()),
            dispatch_allowed: AtomicBool::new(false),
            receive_flag: AtomicBool::new(false),
            idle_flag: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(true),
            auto_reconnect_allowed: AtomicBool::new(false),
            auto_reconnect_pending: AtomicBool::new(false),
            response_timeout_ms: AtomicU64::new(DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64),
        });

        let daemon = Arc::new(DeviceInner::new(DAEMON_UID, "2".to_string(), None));
        daemon.declare_function(
            FUNCTION_GET_AUTHENTICATION_NONCE,
            ResponseExpectedFlag::AlwaysTrue,
        );
        daemon.declare_function(FUNCTION_AUTHENTICATE, ResponseExpectedFlag::True);
        inner
            .devices
            .lock()
            .insert(DAEMON_UID, Arc::downgrade(&daemon));

        Self { inner, daemon }
    }

    /// Open a TCP connection to the daemon at `host:port` and start the
    /// session threads.
    ///
    /// Returns once the socket is open; the authentication handshake, if
    /// any, is a separate step. Fails with [`Error::AlreadyConnected`] when
    /// a connection is already established.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let mut socket = self.inner.socket.lock();

        if socket.stream.is_some() {
            return Err(Error::AlreadyConnected(format!(
                "{}:{}",
                socket.host, socket.port
            )));
        }

        socket.host = host.to_string();
        socket.port = port;

        connect_locked(&self.inner, &mut socket, ConnectReason::Request)
    }

    /// Tear down the session: prober, receive loop, socket and dispatcher,
    /// in that order. Pending auto-reconnects are cancelled.
    ///
    /// Fails with [`Error::NotConnected`] when no connection is established
    /// and no reconnect is pending.
    pub fn disconnect(&self) -> Result<()> {
        let taken = {
            let mut socket = self.inner.socket.lock();

            self.inner
                .auto_reconnect_allowed
                .store(false, Ordering::Relaxed);

            if self.inner.auto_reconnect_pending.load(Ordering::Relaxed) {
                self.inner
                    .auto_reconnect_pending
                    .store(false, Ordering::Relaxed);
            } else {
                if socket.stream.is_none() {
                    return Err(Error::NotConnected);
                }

                self.inner.disconnect_locked(&mut socket);
            }

            self.inner.dispatcher.lock().take()
        };

        if let Some(dispatcher) = taken {
            dispatcher.send(QueueItem::Disconnected(DisconnectReason::Request, 0));
            dispatcher.send(QueueItem::Exit);
            dispatcher.join_unless_current();
        }

        log::info!("Connection: disconnected");
        Ok(())
    }

    /// Broadcast an enumerate request; every attached device answers with
    /// an enumerate callback.
    pub fn enumerate(&self) -> Result<()> {
        let (request, _) = self.inner.create_request(
            BROADCAST_UID,
            HEADER_LEN as u8,
            FUNCTION_ENUMERATE,
            false,
        );

        self.inner.send_request(&request)
    }

    /// Authenticate against a daemon with a configured secret.
    ///
    /// Fetches the server nonce, computes HMAC-SHA1 over
    /// server nonce + client nonce keyed with `secret`, and submits the
    /// client nonce plus digest. Single-flight; concurrent calls serialize.
    pub fn authenticate(&self, secret: &str) -> Result<()> {
        let mut next_nonce = self.inner.authentication_nonce.lock();

        if *next_nonce == 0 {
            *next_nonce = u64::from(OsRng.next_u32());
        }

        let server_nonce = self.get_authentication_nonce()?;
        let client_nonce = (*next_nonce as u32).to_le_bytes();
        *next_nonce = (*next_nonce + 1) % (1 << 32);

        let digest = hmac_sha1(secret.as_bytes(), &server_nonce, &client_nonce)?;

        let mut payload = Vec::with_capacity(client_nonce.len() + digest.len());
        payload.extend_from_slice(&client_nonce);
        payload.extend_from_slice(&digest);

        device::transact(self, &self.daemon, FUNCTION_AUTHENTICATE, &payload)?;

        log::info!("Connection: authenticated");
        Ok(())
    }

    fn get_authentication_nonce(&self) -> Result<[u8; 4]> {
        let response = device::transact(self, &self.daemon, FUNCTION_GET_AUTHENTICATION_NONCE, &[])?
            .unwrap_or_default();

        if response.len() < 4 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated authentication nonce response",
            )));
        }

        Ok([response[0], response[1], response[2], response[3]])
    }

    /// Current lifecycle state.
    pub fn get_connection_state(&self) -> ConnectionState {
        if self.inner.socket.lock().stream.is_some() {
            return ConnectionState::Connected;
        }

        if self.inner.auto_reconnect_pending.load(Ordering::Relaxed) {
            ConnectionState::Pending
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Enable or disable auto-reconnect. Disabling also cancels the
    /// permission for any reconnect already earned by a lost connection.
    pub fn set_auto_reconnect(&self, auto_reconnect: bool) {
        self.inner
            .auto_reconnect
            .store(auto_reconnect, Ordering::Relaxed);

        if !auto_reconnect {
            self.inner
                .auto_reconnect_allowed
                .store(false, Ordering::Relaxed);
        }
    }

    /// Whether auto-reconnect is enabled.
    pub fn get_auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::Relaxed)
    }

    /// Set the response timeout for correlated requests. Default 2500 ms.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .response_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current response timeout for correlated requests.
    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.response_timeout_ms.load(Ordering::Relaxed))
    }

    /// Register a listener for connected meta-events.
    pub fn add_connected_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(ConnectReason) + Send + 'static,
    {
        let boxed: Box<dyn FnMut(ConnectReason) + Send> = Box::new(listener);
        let mut guard = self.inner.listeners.lock();
        let id = ListenerId(guard.next_id);
        guard.next_id += 1;
        guard.connected.push((id, Arc::new(Mutex::new(boxed))));
        id
    }

    /// Register a listener for disconnected meta-events.
    pub fn add_disconnected_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(DisconnectReason) + Send + 'static,
    {
        let boxed: Box<dyn FnMut(DisconnectReason) + Send> = Box::new(listener);
        let mut guard = self.inner.listeners.lock();
        let id = ListenerId(guard.next_id);
        guard.next_id += 1;
        guard.disconnected.push((id, Arc::new(Mutex::new(boxed))));
        id
    }

    /// Register a listener for enumerate callbacks.
    pub fn add_enumerate_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&EnumerateEvent) + Send + 'static,
    {
        let boxed: Box<dyn FnMut(&EnumerateEvent) + Send> = Box::new(listener);
        let mut guard = self.inner.listeners.lock();
        let id = ListenerId(guard.next_id);
        guard.next_id += 1;
        guard.enumerate.push((id, Arc::new(Mutex::new(boxed))));
        id
    }

    /// Unregister a previously added listener. Returns whether the id was
    /// found.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut guard = self.inner.listeners.lock();
        let before =
            guard.connected.len() + guard.disconnected.len() + guard.enumerate.len();

        guard.connected.retain(|(entry, _)| *entry != id);
        guard.disconnected.retain(|(entry, _)| *entry != id);
        guard.enumerate.retain(|(entry, _)| *entry != id);

        guard.connected.len() + guard.disconnected.len() + guard.enumerate.len() != before
    }

    /// Insert a device into the registry, pruning entries whose handles
    /// are gone. The registry holds weak references; devices are owned by
    /// application code.
    pub(crate) fn register_device(&self, device: &Arc<DeviceInner>) {
        let mut devices = self.inner.devices.lock();
        devices.retain(|_, entry| entry.upgrade().is_some());
        devices.insert(device.uid, Arc::downgrade(device));
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// HMAC-SHA1 over server nonce + client nonce, keyed with the shared
/// secret.
fn hmac_sha1(secret: &[u8], server_nonce: &[u8], client_nonce: &[u8]) -> Result<[u8; 20]> {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret).map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(server_nonce);
    mac.update(client_nonce);

    let bytes = mac.finalize().into_bytes();
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&bytes);

    Ok(digest)
}
