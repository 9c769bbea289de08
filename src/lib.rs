//! brickbus - client library for the brick daemon TCP protocol
//!
//! The daemon multiplexes access to a set of modular hardware peripherals
//! (bricks and bricklets) over a small binary request/response protocol.
//! This crate provides the connection and protocol engine: packet framing,
//! sequence-number correlation between requests and responses, the
//! background receive loop, callback dispatch, disconnect probing with
//! auto-reconnect, and the authentication handshake.
//!
//! Typed per-device wrappers are built on top of two primitives:
//! [`Device::request`] (build and send a request packet, optionally block
//! for its response) and [`Device::register_callback`] (receive decoded
//! callback packets for a given function id).
//!
//! # Thread Model
//!
//! Each connected session runs three long-lived threads:
//!
//! 1. **Receive Loop**: blocks only on socket reads, slices packets out of
//!    the byte stream and routes them.
//! 2. **Disconnect Prober**: sends a no-op probe when the connection has
//!    been idle, detecting silently lost peers.
//! 3. **Callback Dispatcher**: serializes delivery of meta-events and
//!    device callbacks to user listeners, and runs the auto-reconnect
//!    retry loop.
//!
//! Callers block only in [`Device::request`], bounded by the configurable
//! response timeout.
//!
//! # Example
//!
//! ```no_run
//! use brickbus::{Connection, Device};
//!
//! # fn main() -> brickbus::Result<()> {
//! let connection = Connection::new();
//! connection.connect("localhost", 4223)?;
//!
//! let device = Device::new(&connection, "abc4", None)?;
//! let identity = device.get_identity()?;
//! println!("device type: {}", identity.device_identifier);
//!
//! connection.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod base58;
pub mod connection;
pub mod device;
pub mod error;
pub mod packet;

mod ring_buffer;

// Re-export commonly used types
pub use connection::{
    ConnectReason, Connection, ConnectionState, DisconnectReason, ListenerId,
};
pub use device::{Device, ResponseExpectedFlag};
pub use error::{Error, Result};
pub use packet::{EnumerateEvent, EnumerationType, Identity};
