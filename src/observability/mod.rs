//! # Observability
//!
//! Logging setup and the metric families emitted across the server.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{compress_username, install_prometheus_recorder};
