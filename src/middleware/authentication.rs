//! # Authentication Stage
//!
//! Calls the injected [`Authenticator`] with the raw request. On success the
//! identity is stored in the request context, the `Authorization` header is
//! removed so no inner stage or delegate ever sees the credential, and a
//! bucketed per-user counter is incremented. On failure the failed handler
//! writes a 401 and the inner stages never run.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{error, warn};

use crate::auth::authenticator::Authenticator;
use crate::observability::metrics;
use crate::request::RequestContext;
use crate::responses;

pub struct AuthenticationStage {
    authenticator: Option<Arc<dyn Authenticator>>,
    supports_basic_auth: bool,
}

impl AuthenticationStage {
    /// `None` disables authentication; requests pass through without an identity.
    pub fn new(authenticator: Option<Arc<dyn Authenticator>>, supports_basic_auth: bool) -> Self {
        if authenticator.is_none() {
            warn!("Authentication is disabled");
        }
        Self {
            authenticator,
            supports_basic_auth,
        }
    }

    /// Response for requests that failed authentication
    fn failed(&self, request: &Request) -> Response {
        let uri = request.uri().to_string();
        let Some(ctx) = RequestContext::from_request(request) else {
            return responses::internal_error(&uri, &"no context found for request");
        };
        if ctx.request_info().is_none() {
            return responses::internal_error(&uri, &"no RequestInfo found in the context");
        }
        responses::unauthorized(self.supports_basic_auth)
    }
}

pub async fn authentication_stage(
    State(stage): State<Arc<AuthenticationStage>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(authenticator) = stage.authenticator.as_ref() else {
        return next.run(request).await;
    };

    let (mut parts, body) = request.into_parts();
    let result = authenticator.authenticate(&parts).await;
    parts.headers.remove(header::AUTHORIZATION);
    let request = Request::from_parts(parts, body);

    let user = match result {
        Ok(Some(user)) => user,
        Ok(None) => {
            error!(uri = %request.uri(), "Unable to authenticate the request: no credentials accepted");
            return stage.failed(&request);
        }
        Err(e) => {
            error!(uri = %request.uri(), error = %e, "Unable to authenticate the request");
            return stage.failed(&request);
        }
    };

    let uri = request.uri().to_string();
    let Some(ctx) = RequestContext::from_request(&request) else {
        return responses::internal_error(&uri, &"no context found for request");
    };

    metrics::record_authenticated_user(&user.name);
    if ctx.set_user(user).is_err() {
        return responses::internal_error(&uri, &"user already set for request");
    }

    next.run(request).await
}
