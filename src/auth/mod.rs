//! # Identity and Policy Contracts
//!
//! The request pipeline never authenticates or authorizes on its own; it calls
//! injected providers through the narrow traits defined here.
//!
//! - [`authenticator::Authenticator`]: raw request -> identity
//! - [`authorizer::Authorizer`]: attributes -> allow/deny decision
//!
//! A static bearer-token authenticator and the always-allow/always-deny
//! authorizers are included for wiring the binary and for tests.

pub mod authenticator;
pub mod authorizer;
pub mod user;

pub use authenticator::{Authenticator, StaticTokenAuthenticator};
pub use authorizer::{AlwaysAllowAuthorizer, AlwaysDenyAuthorizer, Attributes, Authorizer, Decision};
pub use user::UserInfo;
