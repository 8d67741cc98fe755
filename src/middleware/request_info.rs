//! Request context attachment and request-info resolution stages.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::error;

use crate::request::{RequestContext, RequestInfoResolver};
use crate::responses;

/// Creates the request's [`RequestContext`]
pub async fn attach_request_context(mut request: Request, next: Next) -> Response {
    let ctx = RequestContext::new();
    ctx.attach(&mut request);
    next.run(request).await
}

/// Resolves the request's [`crate::request::RequestInfo`] into its context
pub async fn resolve_request_info(
    State(resolver): State<Arc<RequestInfoResolver>>,
    request: Request,
    next: Next,
) -> Response {
    let uri = request.uri().to_string();
    let Some(ctx) = RequestContext::from_request(&request) else {
        error!(uri = %uri, "No request context found for request");
        return responses::internal_error(&uri, &"no RequestContext found for request");
    };

    let info = match resolver.resolve(
        request.method().as_str(),
        request.uri().path(),
        request.uri().query(),
    ) {
        Ok(info) => info,
        Err(e) => {
            error!(uri = %uri, error = %e, "Unable to resolve request info");
            return responses::internal_error(&uri, &e);
        }
    };

    if ctx.set_request_info(info).is_err() {
        error!(uri = %uri, "Request info resolved twice");
        return responses::internal_error(&uri, &"request info already resolved");
    }

    next.run(request).await
}
