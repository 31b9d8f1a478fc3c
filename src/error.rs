//! # Error Types
//!
//! Error handling for the transport.
//!
//! Internally every fallible step returns [`Result`]. The public `Client` and
//! `Server` surface never hands these errors to the caller: failures are
//! turned into `false` returns, log lines, or a `Disconnected` event.
//!
//! ## Error Categories
//! - **I/O Errors**: socket failures, peer resets, timeouts
//! - **Protocol Errors**: length headers above the configured maximum
//! - **Usage Errors**: sending while disconnected, unknown connection ids
//! - **Resource Errors**: send/receive queue limits
//! - **Fatal Errors**: connection id space exhausted
//!
//! ## Example Usage
//! ```rust
//! use msgpipe::error::{ProtocolError, Result};
//!
//! fn check_size(len: usize, max: usize) -> Result<()> {
//!     if len > max {
//!         return Err(ProtocolError::OversizedPacket(len));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_size(10, 16).is_ok());
//! assert!(matches!(check_size(17, 16), Err(ProtocolError::OversizedPacket(17))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Usage errors
    pub const ERR_NOT_CONNECTED: &str = "Not connected";
    pub const ERR_ALREADY_CONNECTING: &str = "Already connecting or connected";
    pub const ERR_SERVER_ACTIVE: &str = "Server already active";
    pub const ERR_SERVER_INACTIVE: &str = "Server not active";

    /// Protocol validation errors
    pub const ERR_OVERSIZED_PACKET: &str = "Message exceeds maximum size";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_SEND_TIMEOUT: &str = "Send timed out";
    pub const ERR_RECEIVE_TIMEOUT: &str = "Receive timed out";
    pub const ERR_CONNECT_TIMEOUT: &str = "Connect timed out";

    /// Resource errors
    pub const ERR_SEND_QUEUE_LIMIT: &str = "Send queue limit reached";
    pub const ERR_RECEIVE_QUEUE_LIMIT: &str = "Receive queue limit reached";

    /// Fatal errors
    pub const ERR_CONNECTION_ID_EXHAUSTED: &str = "Connection id space exhausted";
}

// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Timeout occurred: {0}")]
    Timeout(&'static str),

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown connection: {0}")]
    UnknownConnection(u32),

    #[error("Queue limit exceeded: {0}")]
    QueueLimitExceeded(&'static str),

    #[error("Connection id space exhausted")]
    ConnectionIdExhausted,

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the error ends only the affected connection.
    ///
    /// Everything except identifier exhaustion is connection-scoped.
    pub fn is_connection_scoped(&self) -> bool {
        !matches!(self, ProtocolError::ConnectionIdExhausted)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
