//! # msgpipe
//!
//! Message-oriented TCP transport. Every message travels as a 4-byte
//! big-endian length followed by the payload; the receiver always gets back
//! exactly the messages that were sent, in order.
//!
//! Sockets are serviced by background tasks. Received messages and
//! connection events are queued and handed to the application only when it
//! calls `tick`, on the application's own thread and schedule.
//!
//! ## Example
//! ```rust,no_run
//! use msgpipe::{Client, ClientConfig, Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::default()).unwrap();
//! server.on_data(|id, bytes| println!("{id} sent {} bytes", bytes.len()));
//! server.start(7777);
//!
//! let client = Client::new(ClientConfig::default()).unwrap();
//! client.connect("127.0.0.1", 7777);
//!
//! loop {
//!     if client.connected() {
//!         client.send(&[1, 2, 3]);
//!     }
//!     client.tick(100, None);
//!     server.tick(100, None);
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod pipe;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, LoggingConfig, NetworkConfig, ServerConfig, TransportConfig};
pub use crate::core::message::{ConnectionId, EventKind, Message};
pub use crate::error::{ProtocolError, Result};
pub use crate::pipe::Segment;
pub use crate::transport::{Client, Server};
pub use crate::utils::logging::init_logging;
