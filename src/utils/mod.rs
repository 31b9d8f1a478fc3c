//! # Utility Modules
//!
//! Supporting utilities shared by the pipes and the transport.
//!
//! ## Components
//! - **Buffer Pool**: fixed-capacity message buffer recycling
//! - **Logging**: `tracing-subscriber` setup from [`crate::config::LoggingConfig`]
//! - **Metrics**: thread-safe transport counters

pub mod buffer_pool;
pub mod logging;
pub mod metrics;

// Re-export public types for advanced users
pub use buffer_pool::BufferPool;
pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
