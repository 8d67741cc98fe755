//! # Audit Stage
//!
//! Builds exactly one [`AuditEvent`] per audited request before the inner
//! stages run, attaches it to the request context and delivers it to the
//! backend at three possible points:
//!
//! 1. `RequestReceived`: right after construction
//! 2. `ResponseComplete`: after the inner stages returned, with the response
//!    status and, at `RequestResponse` level, the response object
//! 3. `Panic`: when an inner stage panicked; the panic is re-raised afterwards
//!    so only the outermost stage recovers it
//!
//! The policy's level is decided once, up front. `Level::None` skips auditing
//! entirely.
//!
//! Auditing never changes the outcome of a request. Bodies are recorded only
//! when their size is known and within [`MAX_AUDITED_BODY_BYTES`]; anything
//! else passes through untouched and the event simply carries no object. If
//! the request future is dropped before the inner stages return (the timeout
//! stage gives up on it), the event is still completed: with a 504 when the
//! deadline has passed.

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::audit::backend::AuditBackend;
use crate::audit::event::{AuditEvent, Level, Stage};
use crate::audit::policy::AuditPolicy;
use crate::auth::authorizer::Attributes;
use crate::middleware::panic_recovery::panic_message;
use crate::middleware::timeout::TIMEOUT_MESSAGE;
use crate::observability::metrics;
use crate::request::{LongRunningCheck, RequestContext};
use crate::responses;

/// Largest body the audit stage will buffer
pub const MAX_AUDITED_BODY_BYTES: usize = 3 * 1024 * 1024;

pub struct AuditStage {
    backend: Option<Arc<dyn AuditBackend>>,
    policy: Arc<dyn AuditPolicy>,
    long_running: LongRunningCheck,
}

impl AuditStage {
    /// `None` disables auditing
    pub fn new(
        backend: Option<Arc<dyn AuditBackend>>,
        policy: Arc<dyn AuditPolicy>,
        long_running: LongRunningCheck,
    ) -> Self {
        Self {
            backend,
            policy,
            long_running,
        }
    }

    /// Deliver the current snapshot of the request's event
    fn deliver(&self, backend: &dyn AuditBackend, ctx: &RequestContext) {
        if let Some(event) = ctx.audit_event() {
            metrics::record_audit_event(event.level.as_str());
            backend.process_events(std::slice::from_ref(&event));
        }
    }
}

fn is_json(content_type: Option<&HeaderValue>) -> bool {
    content_type
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

/// Outcome of trying to buffer a body for the audit record
enum Buffered {
    Bytes(Bytes),
    /// Too large or of unknown size; handed back unread
    Skipped(Body),
}

/// Buffer `body` when its size is known and fits under the audit cap.
async fn buffer_for_audit(body: Body) -> Result<Buffered, axum::Error> {
    let fits = body
        .size_hint()
        .upper()
        .map(|upper| upper <= MAX_AUDITED_BODY_BYTES as u64)
        .unwrap_or(false);
    if !fits {
        return Ok(Buffered::Skipped(body));
    }
    axum::body::to_bytes(body, MAX_AUDITED_BODY_BYTES)
        .await
        .map(Buffered::Bytes)
}

/// Completes the audit record if the request future is dropped before the
/// inner stages return.
struct CompleteOnDrop {
    stage: Arc<AuditStage>,
    backend: Arc<dyn AuditBackend>,
    ctx: RequestContext,
    armed: bool,
}

impl CompleteOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let timed_out = self
            .ctx
            .deadline()
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false);
        self.ctx.with_audit_event(|event| {
            event.advance(Stage::ResponseComplete);
            if timed_out {
                event.log_response_status(
                    StatusCode::GATEWAY_TIMEOUT,
                    Some(TIMEOUT_MESSAGE.to_string()),
                );
            } else {
                warn!(audit_id = %event.audit_id, "Request abandoned before it completed");
            }
        });
        self.stage.deliver(self.backend.as_ref(), &self.ctx);
    }
}

pub async fn audit_stage(
    State(stage): State<Arc<AuditStage>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(backend) = stage.backend.clone() else {
        return next.run(request).await;
    };

    let uri = request.uri().to_string();
    let Some(ctx) = RequestContext::from_request(&request) else {
        error!(uri = %uri, "No request context found for request");
        return responses::internal_error(&uri, &"no context found for request");
    };
    let attributes = match Attributes::from_context(&ctx) {
        Ok(attributes) => attributes,
        Err(e) => {
            error!(uri = %uri, error = %e, "Failed to build audit attributes");
            return responses::internal_error(&uri, &e);
        }
    };

    let level = stage.policy.level(&attributes);
    if level == Level::None {
        return next.run(request).await;
    }

    let long_running = ctx
        .request_info()
        .map(|info| stage.long_running.is_long_running(info))
        .unwrap_or(false);
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let (parts, body) = request.into_parts();
    let Some(info) = ctx.request_info() else {
        return responses::internal_error(&uri, &"no RequestInfo found in the context");
    };
    let mut event = AuditEvent::from_request(
        &parts,
        info,
        ctx.authenticated_user(),
        level,
        remote_addr,
    );

    let body = if level >= Level::Request && !long_running {
        match buffer_for_audit(body).await {
            Ok(Buffered::Bytes(bytes)) => {
                if is_json(parts.headers.get(header::CONTENT_TYPE)) {
                    if let Err(e) = event.log_request_object(&bytes) {
                        warn!(audit_id = %event.audit_id, error = %e, "Auditing failed of {} request", event.verb);
                    }
                }
                Body::from(bytes)
            }
            Ok(Buffered::Skipped(body)) => {
                warn!(audit_id = %event.audit_id, "Request body too large to audit for {}", uri);
                body
            }
            Err(e) => {
                error!(uri = %uri, error = %e, "Failed to read request body for audit");
                return responses::internal_error(&uri, &e);
            }
        }
    } else {
        body
    };

    let audit_id = event.audit_id.clone();
    if ctx.set_audit_event(event).is_err() {
        return responses::internal_error(&uri, &"audit event already attached to request");
    }
    stage.deliver(backend.as_ref(), &ctx);

    let mut completion = CompleteOnDrop {
        stage: Arc::clone(&stage),
        backend: Arc::clone(&backend),
        ctx: ctx.clone(),
        armed: true,
    };

    let request = Request::from_parts(parts, body);
    let response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            completion.disarm();
            ctx.with_audit_event(|event| {
                event.advance(Stage::Panic);
                event.log_response_status(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(panic_message(payload.as_ref())),
                );
            });
            stage.deliver(backend.as_ref(), &ctx);
            std::panic::resume_unwind(payload);
        }
    };

    let response = if level >= Level::RequestResponse && !long_running {
        let (parts, body) = response.into_parts();
        match buffer_for_audit(body).await {
            Ok(Buffered::Bytes(bytes)) => {
                if is_json(parts.headers.get(header::CONTENT_TYPE)) {
                    let result = ctx.with_audit_event(|event| event.log_response_object(&bytes));
                    if let Some(Err(e)) = result {
                        warn!(audit_id = %audit_id, error = %e, "Audit failed for {} response", uri);
                    }
                } else if !bytes.is_empty() {
                    warn!(audit_id = %audit_id, "Audit failed for {} response: not a JSON object", uri);
                }
                Response::from_parts(parts, Body::from(bytes))
            }
            Ok(Buffered::Skipped(body)) => {
                warn!(audit_id = %audit_id, "Response body too large to audit for {}", uri);
                Response::from_parts(parts, body)
            }
            Err(e) => {
                error!(uri = %uri, error = %e, "Failed to read response body for audit");
                responses::internal_error(&uri, &e)
            }
        }
    } else {
        response
    };

    completion.disarm();
    let (mut parts, body) = response.into_parts();
    ctx.with_audit_event(|event| {
        event.advance(Stage::ResponseComplete);
        event.log_response_status(parts.status, None);
    });
    stage.deliver(backend.as_ref(), &ctx);

    if let Ok(value) = HeaderValue::from_str(&audit_id) {
        parts.headers.insert(HeaderName::from_static("audit-id"), value);
    }
    Response::from_parts(parts, body)
}
