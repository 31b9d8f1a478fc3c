//! Echo server and client in one process.
//!
//! ```text
//! cargo run --example echo -- 7777
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use msgpipe::config::NetworkConfig;
use msgpipe::{init_logging, Client, Result, Server};
use tracing::info;

const MESSAGES: usize = 10;

fn main() -> Result<()> {
    let config = NetworkConfig::from_env()?;
    config.validate_strict()?;
    init_logging(&config.logging);

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7777);

    let server = Arc::new(Server::new(config.server.clone())?);
    let weak = Arc::downgrade(&server);
    server.on_connected(|id| info!(conn_id = id, "client connected"));
    server.on_data(move |id, bytes| {
        if let Some(server) = weak.upgrade() {
            server.send(id, bytes);
        }
    });
    server.on_disconnected(|id| info!(conn_id = id, "client disconnected"));
    if !server.start(port) {
        return Err(msgpipe::ProtocolError::Custom(format!(
            "could not listen on port {port}"
        )));
    }

    let echoed = Arc::new(AtomicUsize::new(0));
    let client = Client::new(config.client.clone())?;
    let counter = Arc::clone(&echoed);
    client.on_data(move |bytes| {
        info!(text = %String::from_utf8_lossy(bytes), "echo");
        counter.fetch_add(1, Ordering::Relaxed);
    });
    client.connect("127.0.0.1", port);

    let mut sent = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    while echoed.load(Ordering::Relaxed) < MESSAGES && Instant::now() < deadline {
        if client.connected() && sent < MESSAGES {
            client.send(format!("message {sent}").as_bytes());
            sent += 1;
        }
        server.tick(100, None);
        client.tick(100, None);
        std::thread::sleep(Duration::from_millis(10));
    }

    client.disconnect();
    server.stop();
    server.metrics().log_metrics();
    Ok(())
}
