//! # Request-Scoped State
//!
//! - [`context::RequestContext`]: typed per-request record shared by every pipeline stage
//! - [`info::RequestInfoResolver`]: turns a method and URI into [`info::RequestInfo`]
//! - [`info::LongRunningCheck`]: decides which requests skip timeouts and admission

pub mod context;
pub mod info;

pub use context::RequestContext;
pub use info::{LongRunningCheck, RequestInfo, RequestInfoResolver};
