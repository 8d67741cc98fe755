//! # Request Pipeline Stages
//!
//! Each stage is an axum middleware function. Stages that need configuration
//! or collaborators take them as `State<Arc<Stage>>`; the rest are plain
//! functions. [`chain::HandlerChain`] assembles them in order.

pub mod audit;
pub mod authentication;
pub mod authorization;
pub mod chain;
pub mod cors;
pub mod impersonation;
pub mod max_inflight;
pub mod panic_recovery;
pub mod request_info;
pub mod timeout;

pub use chain::{build_handler_chain, Collaborators, HandlerChain};
pub use max_inflight::MaxInFlightLimiter;
pub use panic_recovery::ResponseRecorder;
