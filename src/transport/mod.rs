//! # Transport Layer
//!
//! TCP endpoints built on the framing codec and the pipes.
//!
//! ## Components
//! - **Client**: one outgoing connection, events drained by `Client::tick`
//! - **Server**: many accepted connections, events drained by `Server::tick`
//!
//! Each connection runs one receive task and one send task on a Tokio
//! runtime. Socket work never happens on the caller's thread; callbacks never
//! run on a transport task.

pub(crate) mod connection;
pub(crate) mod loops;
pub(crate) mod runtime;

pub mod client;
pub mod server;

pub use client::{Client, CLIENT_CONNECTION_ID};
pub use connection::ConnectionPhase;
pub use server::Server;
