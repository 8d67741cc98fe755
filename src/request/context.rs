//! # Request Context
//!
//! One `RequestContext` is created at chain entry and stored in the request's
//! extensions. It is a cheap `Arc` handle, so stages clone the handle rather than
//! the data. Every slot is write-once: stages add information and never remove it.
//!
//! ## Slots
//! - request info: set by the request-info stage, read by everything after it
//! - authenticated user: set by authentication
//! - impersonated user: set by impersonation, layered on top of the authenticated user
//! - audit event: set once by the audit stage, then mutated additively
//! - deadline: set by the timeout stage for non-long-running requests

use axum::extract::Request;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;

use crate::audit::event::AuditEvent;
use crate::auth::user::UserInfo;
use crate::request::info::RequestInfo;

#[derive(Debug, Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    received_at: Instant,
    deadline: OnceLock<Instant>,
    request_info: OnceLock<RequestInfo>,
    user: OnceLock<UserInfo>,
    impersonated_user: OnceLock<UserInfo>,
    audit_event: OnceLock<Mutex<AuditEvent>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                received_at: Instant::now(),
                deadline: OnceLock::new(),
                request_info: OnceLock::new(),
                user: OnceLock::new(),
                impersonated_user: OnceLock::new(),
                audit_event: OnceLock::new(),
            }),
        }
    }

    /// Look up the context attached to a request
    pub fn from_request<B>(request: &axum::http::Request<B>) -> Option<Self> {
        request.extensions().get::<RequestContext>().cloned()
    }

    /// Attach this context to a request
    pub fn attach(&self, request: &mut Request) {
        request.extensions_mut().insert(self.clone());
    }

    pub fn received_at(&self) -> Instant {
        self.inner.received_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline.get().copied()
    }

    /// Returns false if a deadline was already set
    pub fn set_deadline(&self, deadline: Instant) -> bool {
        self.inner.deadline.set(deadline).is_ok()
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.inner.request_info.get()
    }

    /// Request info is resolved exactly once; a second resolution is rejected.
    pub fn set_request_info(&self, info: RequestInfo) -> Result<(), RequestInfo> {
        self.inner.request_info.set(info)
    }

    /// The effective identity: the impersonated user if any, else the authenticated one
    pub fn user(&self) -> Option<&UserInfo> {
        self.inner
            .impersonated_user
            .get()
            .or_else(|| self.inner.user.get())
    }

    /// The identity that actually authenticated, regardless of impersonation
    pub fn authenticated_user(&self) -> Option<&UserInfo> {
        self.inner.user.get()
    }

    pub fn impersonated_user(&self) -> Option<&UserInfo> {
        self.inner.impersonated_user.get()
    }

    pub fn set_user(&self, user: UserInfo) -> Result<(), UserInfo> {
        self.inner.user.set(user)
    }

    pub fn set_impersonated_user(&self, user: UserInfo) -> Result<(), UserInfo> {
        self.inner.impersonated_user.set(user)
    }

    /// Attach the audit event. The event is created once per request and never replaced.
    pub fn set_audit_event(&self, event: AuditEvent) -> Result<(), AuditEvent> {
        self.inner
            .audit_event
            .set(Mutex::new(event))
            .map_err(|rejected| rejected.into_inner())
    }

    pub fn has_audit_event(&self) -> bool {
        self.inner.audit_event.get().is_some()
    }

    /// Mutate the attached audit event in place; `None` if no event is attached.
    pub fn with_audit_event<R>(&self, f: impl FnOnce(&mut AuditEvent) -> R) -> Option<R> {
        self.inner
            .audit_event
            .get()
            .map(|event| f(&mut event.lock()))
    }

    /// Snapshot of the attached audit event
    pub fn audit_event(&self) -> Option<AuditEvent> {
        self.with_audit_event(|event| event.clone())
    }
}
