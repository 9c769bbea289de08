//! Disconnect probe thread
//!
//! A lost TCP peer is only noticed on the next write. When the connection
//! has been idle for a full interval, this thread sends a fixed no-op probe
//! request; a failed send is treated as a peer disconnect.
//!
//! The prober never acquires the socket-state lock: it is spawned and
//! joined while that lock is held. Probe writes go through the send lock
//! only, the same discipline regular requests use.

use super::{ConnectionInner, DisconnectReason};
use crate::error::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Probe interval while the connection is idle
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic liveness check tied to one socket generation
pub(super) struct Prober {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Prober {
    pub(super) fn spawn(
        inner: Arc<ConnectionInner>,
        request: Vec<u8>,
        socket_id: u64,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("bus-prober".to_string())
            .spawn(move || probe_loop(inner, request, socket_id, shutdown_rx))?;

        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Signal the prober and block until its thread has exited. Ordered
    /// teardown: this runs before the receive loop is torn down, so a
    /// probe send never races a closing socket.
    pub(super) fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn probe_loop(
    inner: Arc<ConnectionInner>,
    request: Vec<u8>,
    socket_id: u64,
    shutdown_rx: Receiver<()>,
) {
    log::debug!("Prober: started (socket generation {})", socket_id);

    loop {
        match shutdown_rx.recv_timeout(PROBE_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if inner.idle_flag.load(Ordering::Relaxed) {
            let write_result = {
                let mut send = inner.send.lock();
                match send.as_mut() {
                    Some(stream) => stream.write_all(&request),
                    None => break,
                }
            };

            if let Err(e) = write_result {
                log::warn!("Prober: probe send failed: {}", e);
                inner.handle_disconnect_by_peer(DisconnectReason::Error, socket_id);
                break;
            }

            log::trace!("Prober: probe sent");
        } else {
            // Traffic was observed since the last tick; arm for the next
            inner.idle_flag.store(true, Ordering::Relaxed);
        }
    }

    log::debug!("Prober: exiting");
}
