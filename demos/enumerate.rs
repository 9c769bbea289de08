//! Discover all devices attached to a brick daemon
//!
//! Broadcasts an enumerate request and prints every device that answers.
//!
//! ```sh
//! RUST_LOG=info cargo run --example enumerate -- [host] [port]
//! ```

use brickbus::Connection;
use std::env;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("localhost").to_string();
    let port: u16 = args.get(2).map(String::as_str).unwrap_or("4223").parse()?;

    let connection = Connection::new();

    connection.add_enumerate_listener(|event| {
        println!(
            "uid={} connected_uid={} position={} hw={}.{}.{} fw={}.{}.{} device={} ({:?})",
            event.uid,
            event.connected_uid,
            event.position,
            event.hardware_version[0],
            event.hardware_version[1],
            event.hardware_version[2],
            event.firmware_version[0],
            event.firmware_version[1],
            event.firmware_version[2],
            event.device_identifier,
            event.enumeration_type,
        );
    });

    connection.connect(&host, port)?;
    connection.enumerate()?;

    // Give attached devices a moment to answer
    thread::sleep(Duration::from_secs(2));

    connection.disconnect()?;
    Ok(())
}
