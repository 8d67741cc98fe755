//! # Handler Chain
//!
//! Wraps a router in the request pipeline. Stages nest in this order, outermost first:
//!
//! ```text
//! panic recovery -> request context -> request info -> timeout -> CORS
//!   -> authentication -> audit -> impersonation -> authorization
//!   -> max-in-flight -> handler
//! ```
//!
//! `Router::layer` wraps everything added before it, so layers are applied
//! innermost first below.

use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use std::sync::Arc;

use crate::audit::backend::AuditBackend;
use crate::audit::policy::AuditPolicy;
use crate::auth::authenticator::Authenticator;
use crate::auth::authorizer::Authorizer;
use crate::core::config::ServerConfig;
use crate::core::error::ApiServerResult;
use crate::middleware::audit::{audit_stage, AuditStage};
use crate::middleware::authentication::{authentication_stage, AuthenticationStage};
use crate::middleware::authorization::{authorization_stage, AuthorizationStage};
use crate::middleware::cors::{cors_stage, CorsStage};
use crate::middleware::impersonation::{impersonation_stage, ImpersonationStage};
use crate::middleware::max_inflight::{max_in_flight_stage, MaxInFlightLimiter};
use crate::middleware::panic_recovery::panic_recovery;
use crate::middleware::request_info::{attach_request_context, resolve_request_info};
use crate::middleware::timeout::{timeout_stage, TimeoutStage};
use crate::request::{LongRunningCheck, RequestInfoResolver};

/// Injected providers used by the pipeline. `None` disables the matching stage.
#[derive(Clone)]
pub struct Collaborators {
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub audit_backend: Option<Arc<dyn AuditBackend>>,
    pub audit_policy: Arc<dyn AuditPolicy>,
}

/// Every configured stage of the pipeline
#[derive(Clone)]
pub struct HandlerChain {
    pub resolver: Arc<RequestInfoResolver>,
    pub timeout: Arc<TimeoutStage>,
    pub cors: Arc<CorsStage>,
    pub authentication: Arc<AuthenticationStage>,
    pub audit: Arc<AuditStage>,
    pub impersonation: Arc<ImpersonationStage>,
    pub authorization: Arc<AuthorizationStage>,
    pub max_in_flight: Arc<MaxInFlightLimiter>,
}

impl HandlerChain {
    pub fn new(config: &ServerConfig, collaborators: &Collaborators) -> ApiServerResult<Self> {
        let long_running = LongRunningCheck::new(
            config.admission.long_running_verbs.iter().cloned(),
            config.admission.long_running_subresources.iter().cloned(),
        );

        Ok(Self {
            resolver: Arc::new(RequestInfoResolver::default()),
            timeout: Arc::new(TimeoutStage::new(
                config.serving.request_timeout,
                long_running.clone(),
            )),
            cors: Arc::new(CorsStage::new(&config.serving.cors_allowed_origins)?),
            authentication: Arc::new(AuthenticationStage::new(
                collaborators.authenticator.clone(),
                config.authentication.supports_basic_auth,
            )),
            audit: Arc::new(AuditStage::new(
                collaborators.audit_backend.clone(),
                Arc::clone(&collaborators.audit_policy),
                long_running,
            )),
            impersonation: Arc::new(ImpersonationStage::new(collaborators.authorizer.clone())),
            authorization: Arc::new(AuthorizationStage::new(collaborators.authorizer.clone())),
            max_in_flight: Arc::new(MaxInFlightLimiter::from_config(&config.admission)),
        })
    }

    /// Wrap `router` (routes and fallback) in every stage
    pub fn apply(&self, router: Router) -> Router {
        router
            .layer(from_fn_with_state(
                Arc::clone(&self.max_in_flight),
                max_in_flight_stage,
            ))
            .layer(from_fn_with_state(
                Arc::clone(&self.authorization),
                authorization_stage,
            ))
            .layer(from_fn_with_state(
                Arc::clone(&self.impersonation),
                impersonation_stage,
            ))
            .layer(from_fn_with_state(Arc::clone(&self.audit), audit_stage))
            .layer(from_fn_with_state(
                Arc::clone(&self.authentication),
                authentication_stage,
            ))
            .layer(from_fn_with_state(Arc::clone(&self.cors), cors_stage))
            .layer(from_fn_with_state(Arc::clone(&self.timeout), timeout_stage))
            .layer(from_fn_with_state(
                Arc::clone(&self.resolver),
                resolve_request_info,
            ))
            .layer(from_fn(attach_request_context))
            .layer(from_fn(panic_recovery))
    }
}

/// Build the chain from configuration and wrap `router` in it
pub fn build_handler_chain(
    router: Router,
    config: &ServerConfig,
    collaborators: &Collaborators,
) -> ApiServerResult<Router> {
    Ok(HandlerChain::new(config, collaborators)?.apply(router))
}
