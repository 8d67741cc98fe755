//! # API Server Core - Library Crate
//!
//! The serving core of a Kubernetes-style control-plane API server: the
//! request pipeline that turns a raw HTTP request into an authenticated,
//! authorized, admission-controlled and audited call, plus the background
//! controllers that keep registered API groups in line with what is served.
//!
//! ## Request Flow
//!
//! ```text
//! panic recovery -> request context -> request info -> timeout -> CORS
//!   -> authentication -> audit -> impersonation -> authorization
//!   -> max-in-flight -> handler
//! ```
//!
//! ## Crate Layout
//! - `core`: error type and configuration
//! - `request`: the per-request context and URL parsing
//! - `auth` / `audit`: collaborator contracts and the audit event lifecycle
//! - `middleware`: one axum middleware per pipeline stage
//! - `server`: health checks, post-start hooks and server assembly
//! - `controllers`: work queue, reconciliation loop and API service registration

/// Error types and configuration shared by every module
pub mod core;

/// Per-request state: the typed context record and the RequestInfo resolver
pub mod request;

/// Identity and policy provider contracts
pub mod auth;

/// Audit events, policies and backends
pub mod audit;

/// Canonical responses written by the pipeline (Status, 429, panic, forbidden)
pub mod responses;

/// Request pipeline stages and the chain that orders them
pub mod middleware;

/// Logging setup and metric families
pub mod observability;

/// Health checks, post-start hooks and server assembly
pub mod server;

/// Work-queue controllers for API service registration
pub mod controllers;

// Re-exports for the common entry points
pub use crate::core::error::{ApiServerError, ApiServerResult};
pub use crate::core::config::ServerConfig;
pub use crate::middleware::chain::{build_handler_chain, Collaborators};
pub use crate::request::context::RequestContext;
pub use crate::server::{GenericApiServer, PreparedApiServer};
