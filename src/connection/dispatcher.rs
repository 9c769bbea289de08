//! Callback dispatch thread
//!
//! Single consumer of the callback queue. Decouples user listener code
//! from the receive loop, so a slow listener never stalls packet reception
//! or the disconnect prober. Connected/disconnected meta-events and packet
//! callbacks share the queue, which makes their relative order match
//! arrival order at the receive loop.
//!
//! Each queue item is dispatched inside `catch_unwind`: a panicking user
//! listener is logged and the same thread continues with the next item.
//!
//! The auto-reconnect retry loop runs on this thread. That is acceptable
//! because it is the dedicated dispatch thread, not the receive thread,
//! and a pending reconnect has nothing to dispatch anyway.

use super::{ConnectReason, ConnectionInner, DisconnectReason, QueueItem};
use crate::error::Result;
use crate::packet::{self, EnumerateEvent, CALLBACK_ENUMERATE};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Delay between auto-reconnect attempts
const RECONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Grace period letting in-flight callback dispatch settle before the
/// disconnected listeners run
const DISPATCH_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Handle to the dispatch worker and its queue
pub(super) struct Dispatcher {
    tx: Sender<QueueItem>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Dispatcher {
    pub(super) fn spawn(inner: Arc<ConnectionInner>) -> Result<Self> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("bus-dispatcher".to_string())
            .spawn(move || dispatch_loop(inner, rx))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            tx,
            handle: Some(handle),
            thread_id,
        })
    }

    pub(super) fn send(&self, item: QueueItem) {
        let _ = self.tx.send(item);
    }

    /// Join the worker unless called from the worker itself: a listener
    /// calling disconnect would otherwise self-join and deadlock. In that
    /// case the worker exits on the queued Exit item after the current
    /// callback returns.
    pub(super) fn join_unless_current(mut self) {
        if thread::current().id() == self.thread_id {
            return;
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn dispatch_loop(inner: Arc<ConnectionInner>, queue: Receiver<QueueItem>) {
    log::debug!("Dispatcher: started");

    loop {
        let Ok(item) = queue.recv() else {
            break;
        };

        if matches!(item, QueueItem::Exit) {
            break;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(&inner, item)));
        if outcome.is_err() {
            log::error!("Dispatcher: listener panicked, continuing with next entry");
        }
    }

    log::debug!("Dispatcher: exiting");
}

fn dispatch(inner: &Arc<ConnectionInner>, item: QueueItem) {
    match item {
        QueueItem::Connected(reason) => inner.call_connected_listeners(reason),
        QueueItem::Disconnected(reason, socket_id) => {
            dispatch_disconnected(inner, reason, socket_id);
        }
        QueueItem::Packet(packet) => {
            // Packets queued around a receive loop teardown must not reach
            // listeners; a callback handler could otherwise race a getter
            // against the closing socket
            if inner.dispatch_allowed.load(Ordering::Relaxed) {
                dispatch_packet(inner, &packet);
            }
        }
        QueueItem::Exit => {}
    }
}

fn dispatch_disconnected(inner: &Arc<ConnectionInner>, reason: DisconnectReason, socket_id: u64) {
    if reason != DisconnectReason::Request {
        // The receive loop is not allowed to hold the socket-state lock,
        // so the teardown it signalled happens here. A different
        // generation means a newer connection already superseded this
        // socket; its teardown signal is stale and must be ignored.
        let mut socket = inner.socket.lock();
        if socket.stream.is_some() && socket.socket_id == socket_id {
            inner.disconnect_locked(&mut socket);
        }
    }

    thread::sleep(DISPATCH_SETTLE_DELAY);

    inner.call_disconnected_listeners(reason);

    if reason != DisconnectReason::Request
        && inner.auto_reconnect.load(Ordering::Relaxed)
        && inner.auto_reconnect_allowed.load(Ordering::Relaxed)
    {
        inner.auto_reconnect_pending.store(true, Ordering::Relaxed);
        log::info!("Dispatcher: connection lost, attempting auto-reconnect");

        loop {
            {
                let mut socket = inner.socket.lock();

                if !inner.auto_reconnect_allowed.load(Ordering::Relaxed)
                    || socket.stream.is_some()
                {
                    // Superseded by an explicit connect or disconnect
                    break;
                }

                match super::connect_locked(inner, &mut socket, ConnectReason::AutoReconnect) {
                    Ok(()) => break,
                    Err(e) => log::debug!("Dispatcher: reconnect attempt failed: {}", e),
                }
            }

            thread::sleep(RECONNECT_RETRY_DELAY);
        }
    }
}

fn dispatch_packet(inner: &Arc<ConnectionInner>, packet: &[u8]) {
    let function_id = packet::function_id(packet);

    if function_id == CALLBACK_ENUMERATE {
        match EnumerateEvent::parse(packet::payload(packet)) {
            Some(event) => inner.call_enumerate_listeners(&event),
            None => log::warn!("Dispatcher: malformed enumerate payload, dropping"),
        }
        return;
    }

    let uid = packet::uid(packet);
    let Some(device) = inner.device(uid) else {
        return;
    };

    device.invoke_callback(function_id, packet::payload(packet));
}
