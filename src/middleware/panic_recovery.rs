//! # Panic Recovery and Response Logging
//!
//! The outermost pipeline stage. It installs a [`ResponseRecorder`] in the
//! request extensions, runs the rest of the chain under `catch_unwind`, and
//! logs one line per request when the request finishes, however it finishes.
//!
//! ## Behaviour
//! - The first recorded status wins; later writes are ignored
//! - A stack trace is captured when the stacktrace predicate matches the status
//!   (by default: below 200 or 500 and above, except 101 Switching Protocols)
//! - A panic is logged with method, URI and stack, and the generic 500 is
//!   written. Nothing leaves this stage before the inner chain returns, so a
//!   panic raised after the handler produced its response still fails the request

use axum::{
    extract::{ConnectInfo, Request},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{error, info};

use crate::responses;

/// Decides whether a status deserves a captured stack trace
pub type StacktracePredicate = fn(StatusCode) -> bool;

pub fn default_stacktrace_predicate(status: StatusCode) -> bool {
    let code = status.as_u16();
    (code < 200 || code >= 500) && status != StatusCode::SWITCHING_PROTOCOLS
}

/// Per-request response bookkeeping shared through request extensions
#[derive(Debug)]
pub struct ResponseRecorder {
    started: Instant,
    status: OnceLock<StatusCode>,
    stack: OnceLock<String>,
    added_info: Mutex<Vec<String>>,
    predicate: StacktracePredicate,
}

impl ResponseRecorder {
    pub fn new(predicate: StacktracePredicate) -> Self {
        Self {
            started: Instant::now(),
            status: OnceLock::new(),
            stack: OnceLock::new(),
            added_info: Mutex::new(Vec::new()),
            predicate,
        }
    }

    pub fn from_request(request: &Request) -> Option<Arc<Self>> {
        request.extensions().get::<Arc<ResponseRecorder>>().cloned()
    }

    /// Record the response status. Returns `false` if a status was already recorded.
    pub fn write_header(&self, status: StatusCode) -> bool {
        if self.status.set(status).is_err() {
            return false;
        }
        if (self.predicate)(status) {
            let _ = self.stack.set(Backtrace::force_capture().to_string());
        }
        true
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status.get().copied()
    }

    /// Attach extra context to this request's log line
    pub fn add_info<S: Into<String>>(&self, info: S) {
        self.added_info.lock().push(info.into());
    }

    fn log(&self, method: &str, uri: &str, user_agent: &str, remote: &str) {
        let latency = self.started.elapsed();
        let status = self
            .status()
            .map(|s| s.as_u16().to_string())
            .unwrap_or_else(|| "0".to_string());
        let stack = self
            .stack
            .get()
            .map(|s| format!("\n{}", s))
            .unwrap_or_default();
        let added: String = self
            .added_info
            .lock()
            .iter()
            .map(|info| format!("\n{}", info))
            .collect();

        info!(
            method = %method,
            uri = %uri,
            status = %status,
            latency_ms = latency.as_millis() as u64,
            "{} {}: ({:?}) {}{}{} [{} {}]",
            method,
            uri,
            latency,
            status,
            stack,
            added,
            user_agent,
            remote
        );
    }
}

/// Logs the request exactly once, including when the request future is dropped
struct LogOnDrop {
    recorder: Arc<ResponseRecorder>,
    method: String,
    uri: String,
    user_agent: String,
    remote: String,
}

impl Drop for LogOnDrop {
    fn drop(&mut self) {
        self.recorder
            .log(&self.method, &self.uri, &self.user_agent, &self.remote);
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub async fn panic_recovery(request: Request, next: Next) -> Response {
    panic_recovery_with(default_stacktrace_predicate, request, next).await
}

pub async fn panic_recovery_with(
    predicate: StacktracePredicate,
    mut request: Request,
    next: Next,
) -> Response {
    let recorder = Arc::new(ResponseRecorder::new(predicate));
    request.extensions_mut().insert(Arc::clone(&recorder));

    let method = request.method().to_string();
    let uri = request.uri().to_string();
    let _log = LogOnDrop {
        recorder: Arc::clone(&recorder),
        method: method.clone(),
        uri: uri.clone(),
        user_agent: request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string(),
        remote: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default(),
    };

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => {
            recorder.write_header(response.status());
            response
        }
        Err(payload) => {
            error!(
                "APIServer panic'd on {} {}: {}\n{}",
                method,
                uri,
                panic_message(payload.as_ref()),
                Backtrace::force_capture()
            );
            recorder.write_header(StatusCode::INTERNAL_SERVER_ERROR);
            responses::panic_response()
        }
    }
}
