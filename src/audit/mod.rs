//! # Audit Pipeline
//!
//! - [`event`]: the per-request [`AuditEvent`] and its [`Level`]
//! - [`policy`]: decides the level for a request
//! - [`backend`]: where events go once built
//!
//! The HTTP side lives in `middleware::audit`, which builds the event before
//! the inner handler runs and completes it afterwards.

pub mod backend;
pub mod event;
pub mod policy;

pub use backend::{AuditBackend, BufferedBackend, InMemoryBackend, LogBackend, UnionBackend};
pub use event::{AuditEvent, Level, Stage};
pub use policy::{AuditPolicy, FixedLevelPolicy, RulePolicy};
