//! # Core Protocol Components
//!
//! Wire framing and the event type handed to consumers.
//!
//! ## Components
//! - **Codec**: length-prefix framing, both as pure functions and as a
//!   Tokio codec for reading frames off a byte stream
//! - **Message**: connection events (`Connected`, `Data`, `Disconnected`)
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [Payload(N)] [Length(4)] [Payload(N)] ...
//! ```
//!
//! Connection open/close is never transmitted; those events are synthesized
//! locally by the receive loop.
//!
//! ## Security
//! - Length headers above the configured maximum are rejected before any
//!   payload allocation

pub mod codec;
pub mod message;
