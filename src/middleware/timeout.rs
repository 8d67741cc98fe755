//! Deadline stage for requests that are not long-running.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::core::error::ApiServerError;
use crate::request::{LongRunningCheck, RequestContext};
use crate::responses;

pub const TIMEOUT_MESSAGE: &str = "request did not complete within allowed duration";

#[derive(Debug, Clone)]
pub struct TimeoutStage {
    request_timeout: Duration,
    long_running: LongRunningCheck,
}

impl TimeoutStage {
    pub fn new(request_timeout: Duration, long_running: LongRunningCheck) -> Self {
        Self {
            request_timeout,
            long_running,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Bounds the rest of the chain by the request timeout. Long-running requests
/// run unbounded. On expiry the inner future is dropped, which releases
/// anything it held (admission slots included), and a 504 is returned.
pub async fn timeout_stage(
    State(stage): State<Arc<TimeoutStage>>,
    request: Request,
    next: Next,
) -> Response {
    let uri = request.uri().to_string();
    let Some(ctx) = RequestContext::from_request(&request) else {
        error!(uri = %uri, "No request context found for request");
        return responses::internal_error(&uri, &"no RequestContext found for request");
    };
    let Some(info) = ctx.request_info() else {
        error!(uri = %uri, "No request info found for request");
        return responses::internal_error(&uri, &"no RequestInfo found in the context");
    };

    if stage.long_running.is_long_running(info) {
        return next.run(request).await;
    }

    ctx.set_deadline(ctx.received_at() + stage.request_timeout);

    match tokio::time::timeout(stage.request_timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(uri = %uri, timeout = ?stage.request_timeout, "Request timed out");
            ApiServerError::timeout(TIMEOUT_MESSAGE).into_response()
        }
    }
}
