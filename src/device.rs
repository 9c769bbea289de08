//! Per-device correlation state and the public device handle
//!
//! Every peripheral behind the daemon is represented by a [`Device`]. The
//! handle owns the correlation state for the synchronous request/response
//! protocol: while a correlated request is in flight the device records the
//! expected (function id, sequence number) pair, and the receive loop hands
//! the matching response over through a single-slot channel. A per-device
//! mutex serializes correlated requests, so two devices on the same
//! connection never block each other.
//!
//! Device handles share ownership of the connection; the connection only
//! keeps a weak reference back (see the device table in the connection
//! module), so dropping all handles releases the device.

use crate::base58;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::packet::{self, Identity, FUNCTION_GET_IDENTITY, HEADER_LEN, MAX_PACKET_LEN};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Response-expected policy for one function id
///
/// Getters always produce a response; setters only do when the flag is
/// enabled, which allows callers to detect timeouts and peer-side errors at
/// the cost of one round-trip per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseExpectedFlag {
    /// Function always responds (getters); cannot be disabled
    AlwaysTrue,
    /// Function never responds (callback function ids); cannot be enabled
    AlwaysFalse,
    /// Function currently responds, may be toggled
    True,
    /// Function currently does not respond, may be toggled
    False,
}

/// Handler invoked by the callback dispatcher with the raw payload of an
/// unsolicited callback packet
pub type CallbackHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Lazy device-identifier verification state
enum IdentifierCheck {
    Pending,
    Matched,
    Mismatch(u16),
}

/// Correlation state shared between the device handle and the connection's
/// receive loop
pub(crate) struct DeviceInner {
    pub(crate) uid: u32,
    uid_string: String,
    api_version: Mutex<[u8; 3]>,
    expected_device_identifier: Option<u16>,
    identifier_check: Mutex<IdentifierCheck>,
    /// Serializes correlated requests; at most one in flight per device
    request_mutex: Mutex<()>,
    /// Expected response ids, 0 when no request is in flight
    expected_function_id: AtomicU8,
    expected_sequence_number: AtomicU8,
    /// Single-slot response channel, receive loop side never blocks
    response_tx: Sender<Vec<u8>>,
    response_rx: Receiver<Vec<u8>>,
    response_expected: Mutex<HashMap<u8, ResponseExpectedFlag>>,
    callbacks: Mutex<HashMap<u8, CallbackHandler>>,
}

impl DeviceInner {
    pub(crate) fn new(
        uid: u32,
        uid_string: String,
        expected_device_identifier: Option<u16>,
    ) -> Self {
        let (response_tx, response_rx) = bounded(1);
        let mut response_expected = HashMap::new();
        response_expected.insert(FUNCTION_GET_IDENTITY, ResponseExpectedFlag::AlwaysTrue);

        Self {
            uid,
            uid_string,
            api_version: Mutex::new([0, 0, 0]),
            expected_device_identifier,
            identifier_check: Mutex::new(IdentifierCheck::Pending),
            request_mutex: Mutex::new(()),
            expected_function_id: AtomicU8::new(0),
            expected_sequence_number: AtomicU8::new(0),
            response_tx,
            response_rx,
            response_expected: Mutex::new(response_expected),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Start a correlated request: serialize against other requests on this
    /// device, drop any stale response left over from a timed-out
    /// predecessor and record the expected response ids. The ids are cleared
    /// again when the returned guard drops.
    pub(crate) fn begin_request(&self, function_id: u8, sequence_number: u8) -> RequestGuard<'_> {
        let lock = self.request_mutex.lock();

        while self.response_rx.try_recv().is_ok() {
            log::debug!(
                "Device {}: dropping stale response from previous request",
                self.uid_string
            );
        }

        self.expected_function_id.store(function_id, Ordering::SeqCst);
        self.expected_sequence_number
            .store(sequence_number, Ordering::SeqCst);

        RequestGuard {
            device: self,
            _lock: lock,
        }
    }

    /// Block until the matching response arrives or the timeout elapses.
    /// Non-matching packets in the slot are late responses to an earlier
    /// request that already timed out; they are dropped silently.
    pub(crate) fn await_response(
        &self,
        timeout: Duration,
        function_id: u8,
        sequence_number: u8,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(Error::Timeout),
            };

            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => {
                    if packet::function_id(&response) == function_id
                        && packet::sequence_number(&response) == sequence_number
                    {
                        return Ok(response);
                    }
                    log::debug!(
                        "Device {}: dropping late response ({}, {})",
                        self.uid_string,
                        packet::function_id(&response),
                        packet::sequence_number(&response)
                    );
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Hand a response packet to a waiting request. Called from the receive
    /// loop; must never block, so an occupied slot drops the packet instead.
    pub(crate) fn deliver_response(&self, response: Vec<u8>) {
        if self.response_tx.try_send(response).is_err() {
            log::debug!(
                "Device {}: response slot occupied, dropping packet",
                self.uid_string
            );
        }
    }

    /// Whether a response with these ids belongs to the in-flight request
    pub(crate) fn matches_expected(&self, function_id: u8, sequence_number: u8) -> bool {
        sequence_number != 0
            && self.expected_function_id.load(Ordering::SeqCst) == function_id
            && self.expected_sequence_number.load(Ordering::SeqCst) == sequence_number
    }

    /// Whether a callback handler is registered for this function id
    pub(crate) fn has_callback(&self, function_id: u8) -> bool {
        self.callbacks.lock().contains_key(&function_id)
    }

    /// Invoke the registered handler for this callback, if any
    pub(crate) fn invoke_callback(&self, function_id: u8, payload: &[u8]) {
        let mut callbacks = self.callbacks.lock();
        if let Some(handler) = callbacks.get_mut(&function_id) {
            handler(payload);
        }
    }

    /// Declare a function id and its response-expected policy
    pub(crate) fn declare_function(&self, function_id: u8, flag: ResponseExpectedFlag) {
        self.response_expected.lock().insert(function_id, flag);
    }

    /// Look up the current response-expected policy for a function id
    pub(crate) fn response_expected_for(&self, function_id: u8) -> Result<bool> {
        match self.response_expected.lock().get(&function_id) {
            Some(ResponseExpectedFlag::AlwaysTrue) | Some(ResponseExpectedFlag::True) => Ok(true),
            Some(ResponseExpectedFlag::AlwaysFalse) | Some(ResponseExpectedFlag::False) => {
                Ok(false)
            }
            None => Err(Error::InvalidFunctionId(function_id)),
        }
    }
}

/// Clears the expected response ids when a correlated request ends, whether
/// it completed, timed out or failed to send
pub(crate) struct RequestGuard<'a> {
    device: &'a DeviceInner,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.device.expected_function_id.store(0, Ordering::SeqCst);
        self.device
            .expected_sequence_number
            .store(0, Ordering::SeqCst);
    }
}

/// Handle for one peripheral behind the daemon
///
/// Cloning is cheap and yields a handle to the same device state. The
/// device-wrapper layer builds its typed getters and setters on top of
/// [`Device::request`] and [`Device::register_callback`].
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
    connection: Connection,
}

impl Device {
    /// Create a device handle for the given Base58 UID and register it with
    /// the connection.
    ///
    /// When `expected_device_identifier` is given, the first correlated
    /// request verifies the peer's identity lazily and every call fails with
    /// [`Error::WrongDeviceType`] on a mismatch.
    pub fn new(
        connection: &Connection,
        uid: &str,
        expected_device_identifier: Option<u16>,
    ) -> Result<Self> {
        let numeric_uid = base58::uid_from_base58(uid)?;
        let inner = Arc::new(DeviceInner::new(
            numeric_uid,
            uid.to_string(),
            expected_device_identifier,
        ));

        connection.register_device(&inner);

        Ok(Self {
            inner,
            connection: connection.clone(),
        })
    }

    /// Numeric wire UID
    pub fn uid(&self) -> u32 {
        self.inner.uid
    }

    /// Base58 UID string the handle was created with
    pub fn uid_string(&self) -> &str {
        &self.inner.uid_string
    }

    /// API version (major, minor, revision) of the wrapper for this device
    pub fn api_version(&self) -> [u8; 3] {
        *self.inner.api_version.lock()
    }

    /// Set the wrapper API version; called by the device-wrapper layer
    pub fn set_api_version(&self, version: [u8; 3]) {
        *self.inner.api_version.lock() = version;
    }

    /// Declare a function id and its response-expected policy; called by
    /// the device-wrapper layer at construction.
    pub fn declare_function(&self, function_id: u8, flag: ResponseExpectedFlag) {
        self.inner.declare_function(function_id, flag);
    }

    /// Return the response-expected flag for a declared function id
    pub fn get_response_expected(&self, function_id: u8) -> Result<bool> {
        self.inner.response_expected_for(function_id)
    }

    /// Toggle the response-expected flag of a setter or callback
    /// configuration function. Immutable flags (getters, callbacks) reject
    /// the change.
    pub fn set_response_expected(&self, function_id: u8, response_expected: bool) -> Result<()> {
        let mut table = self.inner.response_expected.lock();

        match table.get(&function_id) {
            None => Err(Error::InvalidFunctionId(function_id)),
            Some(ResponseExpectedFlag::AlwaysTrue) | Some(ResponseExpectedFlag::AlwaysFalse) => {
                Err(Error::InvalidParameter { function_id })
            }
            Some(_) => {
                let flag = if response_expected {
                    ResponseExpectedFlag::True
                } else {
                    ResponseExpectedFlag::False
                };
                table.insert(function_id, flag);
                Ok(())
            }
        }
    }

    /// Toggle the response-expected flag for every mutable function at once
    pub fn set_response_expected_all(&self, response_expected: bool) {
        let flag = if response_expected {
            ResponseExpectedFlag::True
        } else {
            ResponseExpectedFlag::False
        };

        for value in self.inner.response_expected.lock().values_mut() {
            if matches!(
                value,
                ResponseExpectedFlag::True | ResponseExpectedFlag::False
            ) {
                *value = flag;
            }
        }
    }

    /// Register a callback handler for an unsolicited callback function id,
    /// replacing any previous handler for the same id.
    pub fn register_callback<F>(&self, function_id: u8, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .insert(function_id, Box::new(handler));
    }

    /// Remove the callback handler for a function id
    pub fn deregister_callback(&self, function_id: u8) {
        self.inner.callbacks.lock().remove(&function_id);
    }

    /// Send a request and, when the response-expected flag for this
    /// function is set, block for the correlated response.
    ///
    /// Returns `Some(payload)` of the response for correlated requests,
    /// `None` for fire-and-forget requests. Peer-side errors embedded in
    /// the response header surface as [`Error::InvalidParameter`],
    /// [`Error::NotSupported`] or [`Error::UnknownErrorCode`].
    pub fn request(&self, function_id: u8, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_device_identifier()?;
        transact(&self.connection, &self.inner, function_id, payload)
    }

    /// Query the device's identity (UID, connected UID, position, hardware
    /// and firmware versions, device identifier).
    pub fn get_identity(&self) -> Result<Identity> {
        let response = transact(&self.connection, &self.inner, FUNCTION_GET_IDENTITY, &[])?
            .unwrap_or_default();

        Identity::parse(&response).ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated identity response",
            ))
        })
    }

    /// Verify the peer's device identifier on first use; single-flight and
    /// memoized.
    fn check_device_identifier(&self) -> Result<()> {
        let Some(expected) = self.inner.expected_device_identifier else {
            return Ok(());
        };

        let mut check = self.inner.identifier_check.lock();

        if let IdentifierCheck::Pending = *check {
            let identity = self.get_identity()?;
            if identity.device_identifier == expected {
                *check = IdentifierCheck::Matched;
            } else {
                log::warn!(
                    "Device {}: expected device identifier {}, peer reports {}",
                    self.inner.uid_string,
                    expected,
                    identity.device_identifier
                );
                *check = IdentifierCheck::Mismatch(identity.device_identifier);
            }
        }

        if let IdentifierCheck::Mismatch(actual) = *check {
            return Err(Error::WrongDeviceType {
                uid: self.inner.uid_string.clone(),
                expected,
                actual,
            });
        }

        Ok(())
    }
}

/// Shared request path for device handles and the connection-internal
/// daemon device: build the packet, send it, and correlate the response
/// when one is expected.
pub(crate) fn transact(
    connection: &Connection,
    device: &Arc<DeviceInner>,
    function_id: u8,
    payload: &[u8],
) -> Result<Option<Vec<u8>>> {
    let response_expected = device.response_expected_for(function_id)?;
    let total_length = HEADER_LEN + payload.len();

    if total_length > MAX_PACKET_LEN {
        return Err(Error::InvalidParameter { function_id });
    }

    let (mut request, sequence_number) = connection.inner.create_request(
        device.uid,
        total_length as u8,
        function_id,
        response_expected,
    );
    request.extend_from_slice(payload);

    if response_expected {
        let _guard = device.begin_request(function_id, sequence_number);
        connection.inner.send_request(&request)?;

        let response =
            device.await_response(connection.get_timeout(), function_id, sequence_number)?;

        match packet::error_code(&response) {
            0 => Ok(Some(packet::payload(&response).to_vec())),
            1 => Err(Error::InvalidParameter { function_id }),
            2 => Err(Error::NotSupported { function_id }),
            error_code => Err(Error::UnknownErrorCode {
                function_id,
                error_code,
            }),
        }
    } else {
        connection.inner.send_request(&request)?;
        Ok(None)
    }
}
