//! Authenticate against a brick daemon with a configured secret
//!
//! ```sh
//! RUST_LOG=info cargo run --example authenticate -- <secret> [host] [port]
//! ```

use brickbus::{ConnectReason, Connection};
use std::env;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let secret = args.get(1).cloned().unwrap_or_else(|| {
        eprintln!("usage: authenticate <secret> [host] [port]");
        std::process::exit(1);
    });
    let host = args.get(2).map(String::as_str).unwrap_or("localhost").to_string();
    let port: u16 = args.get(3).map(String::as_str).unwrap_or("4223").parse()?;

    let connection = Connection::new();

    // Re-authenticate after every reconnect; an auto-reconnected session
    // starts unauthenticated again
    let auth_connection = connection.clone();
    let auth_secret = secret.clone();
    connection.add_connected_listener(move |reason| {
        if reason == ConnectReason::AutoReconnect {
            if let Err(e) = auth_connection.authenticate(&auth_secret) {
                log::error!("Re-authentication failed: {}", e);
            }
        }
    });

    connection.connect(&host, port)?;
    connection.authenticate(&secret)?;
    println!("authenticated");

    connection.enumerate()?;
    thread::sleep(Duration::from_secs(2));

    connection.disconnect()?;
    Ok(())
}
