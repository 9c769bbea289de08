//! Receive loop thread
//!
//! Owns the read side of one socket generation. Reads accumulate in a ring
//! buffer; complete packets (per the header length field) are sliced out
//! and routed to a device's response slot or the callback queue.
//!
//! Reading is the only blocking operation on this thread and no lock is
//! held while blocked. The loop never acquires the socket-state lock: a
//! disconnect call joins this thread while holding that lock, so
//! peer-disconnect signaling is handed off via the callback queue instead.

use super::{ConnectionInner, DisconnectReason, QueueItem};
use crate::error::Result;
use crate::packet::{self, CALLBACK_ENUMERATE, HEADER_LEN, MAX_PACKET_LEN};
use crate::ring_buffer::RingBuffer;
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(super) fn spawn(
    inner: Arc<ConnectionInner>,
    stream: TcpStream,
    socket_id: u64,
) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new()
        .name("bus-receiver".to_string())
        .spawn(move || receive_loop(inner, stream, socket_id))?)
}

fn receive_loop(inner: Arc<ConnectionInner>, mut stream: TcpStream, socket_id: u64) {
    let mut pending: RingBuffer<8192> = RingBuffer::new();
    let mut chunk = [0u8; 512];

    log::debug!("Receiver: started (socket generation {})", socket_id);

    while inner.receive_flag.load(Ordering::Relaxed) {
        let read = stream.read(&mut chunk);

        if !inner.receive_flag.load(Ordering::Relaxed) {
            // Caller-requested teardown closed the socket under us
            break;
        }

        match read {
            Ok(0) => {
                log::info!("Receiver: peer closed the connection");
                inner.handle_disconnect_by_peer(DisconnectReason::Shutdown, socket_id);
                break;
            }
            Ok(n) => pending.extend(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("Receiver: read failed: {}", e);
                inner.handle_disconnect_by_peer(DisconnectReason::Error, socket_id);
                break;
            }
        }

        while pending.len() >= HEADER_LEN {
            let length = pending.get(4).map(usize::from).unwrap_or(0);

            if !(HEADER_LEN..=MAX_PACKET_LEN).contains(&length) {
                // Fatal stream desync; no way to find the next packet
                // boundary, so drop the connection
                log::error!("Receiver: invalid packet length {}, stream out of sync", length);
                inner.handle_disconnect_by_peer(DisconnectReason::Error, socket_id);
                log::debug!("Receiver: exiting");
                return;
            }

            if pending.len() < length {
                // Wait for the complete packet
                break;
            }

            let mut packet = vec![0u8; length];
            pending.copy_into(0, &mut packet);
            pending.advance(length);

            route(&inner, packet);
        }
    }

    log::debug!("Receiver: exiting");
}

/// Route one complete packet: enumerate callbacks and device callbacks go
/// to the callback queue, correlated responses to the owning device's
/// response slot, everything else is dropped silently.
fn route(inner: &ConnectionInner, packet: Vec<u8>) {
    // Any received packet counts as traffic for the disconnect prober
    inner.idle_flag.store(false, Ordering::Relaxed);

    let function_id = packet::function_id(&packet);
    let sequence_number = packet::sequence_number(&packet);

    if sequence_number == 0 && function_id == CALLBACK_ENUMERATE {
        if inner.has_enumerate_listeners() {
            inner.enqueue(QueueItem::Packet(packet));
        }
        return;
    }

    let uid = packet::uid(&packet);
    let Some(device) = inner.device(uid) else {
        // Packet for an unregistered device, not an error
        log::debug!("Receiver: dropping packet for unknown uid {}", uid);
        return;
    };

    if sequence_number == 0 {
        if device.has_callback(function_id) {
            inner.enqueue(QueueItem::Packet(packet));
        }
        return;
    }

    if device.matches_expected(function_id, sequence_number) {
        device.deliver_response(packet);
        return;
    }

    // Late response to a request that already timed out
    log::debug!(
        "Receiver: dropping orphaned response ({}, {}) for uid {}",
        function_id,
        sequence_number,
        uid
    );
}
