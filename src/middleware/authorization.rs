//! Authorization stage: asks the policy provider about the effective identity.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::auth::authorizer::{Attributes, Authorizer};
use crate::middleware::panic_recovery::ResponseRecorder;
use crate::request::RequestContext;
use crate::responses;

pub struct AuthorizationStage {
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl AuthorizationStage {
    /// `None` disables authorization; every request is allowed.
    pub fn new(authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        if authorizer.is_none() {
            warn!("Authorization is disabled");
        }
        Self { authorizer }
    }
}

pub async fn authorization_stage(
    State(stage): State<Arc<AuthorizationStage>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(authorizer) = stage.authorizer.as_ref() else {
        return next.run(request).await;
    };

    let uri = request.uri().to_string();
    let Some(ctx) = RequestContext::from_request(&request) else {
        return responses::internal_error(&uri, &"no context found for request");
    };
    let attributes = match Attributes::from_context(&ctx) {
        Ok(attributes) => attributes,
        Err(e) => {
            error!(uri = %uri, error = %e, "Unable to build authorization attributes");
            return responses::internal_error(&uri, &e);
        }
    };

    match authorizer.authorize(&attributes).await {
        Ok(decision) if decision.allowed => next.run(request).await,
        Ok(decision) => {
            debug!(
                user = %attributes.username(),
                verb = %attributes.verb,
                reason = %decision.reason,
                "Request forbidden"
            );
            if let Some(recorder) = ResponseRecorder::from_request(&request) {
                recorder.add_info(format!(
                    "Forbidden: {:?}, Reason: {:?}",
                    request.uri().to_string(),
                    decision.reason
                ));
            }
            responses::forbidden_error(&attributes, &decision.reason).into_response()
        }
        Err(e) => {
            error!(uri = %uri, error = %e, "Authorization provider failed");
            responses::internal_error(&uri, &e)
        }
    }
}
