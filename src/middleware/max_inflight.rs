//! # Max-In-Flight Admission
//!
//! Two independent concurrency budgets, one for read-only requests
//! (`get`/`list`/`watch`) and one for everything else. Admission never waits:
//! a request either takes a free slot immediately or is rejected with 429 and
//! `Retry-After`. Excess load fails fast instead of piling up latency.
//!
//! - long-running requests bypass the limiter and are never counted
//! - a budget of 0 means that class is unlimited; both 0 disables the stage
//! - members of the privileged group are admitted even when saturated
//! - a slot is an owned semaphore permit, so it is released on every exit
//!   path, including panics and the timeout stage dropping the request

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::core::config::AdmissionConfig;
use crate::observability::metrics::{self, MUTATING_KIND, READ_ONLY_KIND};
use crate::request::{LongRunningCheck, RequestContext, RequestInfo};
use crate::responses;

pub struct MaxInFlightLimiter {
    non_mutating: Option<Arc<Semaphore>>,
    mutating: Option<Arc<Semaphore>>,
    non_mutating_limit: usize,
    mutating_limit: usize,
    long_running: LongRunningCheck,
    privileged_group: String,
}

/// Holds an admission slot and keeps the in-flight gauge in step with it
struct InFlightSlot {
    _permit: OwnedSemaphorePermit,
    kind: &'static str,
}

impl InFlightSlot {
    fn new(permit: OwnedSemaphorePermit, kind: &'static str) -> Self {
        metrics::adjust_inflight(kind, 1.0);
        Self {
            _permit: permit,
            kind,
        }
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        metrics::adjust_inflight(self.kind, -1.0);
    }
}

impl MaxInFlightLimiter {
    pub fn new(
        non_mutating_limit: usize,
        mutating_limit: usize,
        long_running: LongRunningCheck,
        privileged_group: impl Into<String>,
    ) -> Self {
        let gate = |limit: usize| (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        Self {
            non_mutating: gate(non_mutating_limit),
            mutating: gate(mutating_limit),
            non_mutating_limit,
            mutating_limit,
            long_running,
            privileged_group: privileged_group.into(),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(
            config.max_requests_in_flight,
            config.max_mutating_requests_in_flight,
            LongRunningCheck::new(
                config.long_running_verbs.iter().cloned(),
                config.long_running_subresources.iter().cloned(),
            ),
            config.privileged_group.clone(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.non_mutating.is_some() || self.mutating.is_some()
    }

    /// Slots currently free in each class, `None` for an unlimited class
    pub fn available(&self) -> (Option<usize>, Option<usize>) {
        (
            self.non_mutating.as_ref().map(|s| s.available_permits()),
            self.mutating.as_ref().map(|s| s.available_permits()),
        )
    }

    pub fn limits(&self) -> (usize, usize) {
        (self.non_mutating_limit, self.mutating_limit)
    }

    fn gate_for(&self, info: &RequestInfo) -> (Option<&Arc<Semaphore>>, &'static str) {
        if info.is_mutating() {
            (self.mutating.as_ref(), MUTATING_KIND)
        } else {
            (self.non_mutating.as_ref(), READ_ONLY_KIND)
        }
    }
}

fn record_rejection(info: &RequestInfo, kind: &'static str) {
    let scope = if info.namespace.is_empty() {
        "cluster"
    } else {
        "namespace"
    };
    let resource = if info.is_resource_request {
        info.resource.as_str()
    } else {
        info.path.as_str()
    };
    metrics::monitor_request(
        &info.verb,
        resource,
        &info.subresource,
        scope,
        StatusCode::TOO_MANY_REQUESTS.as_u16(),
    );
    metrics::record_dropped_request(kind);
}

pub async fn max_in_flight_stage(
    State(limiter): State<Arc<MaxInFlightLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(request).await;
    }

    let uri = request.uri().to_string();
    let Some(ctx) = RequestContext::from_request(&request) else {
        error!(uri = %uri, "No context found for request");
        return responses::internal_error(&uri, &"no context found for request");
    };
    let Some(info) = ctx.request_info() else {
        error!(uri = %uri, "No RequestInfo found in the context");
        return responses::internal_error(&uri, &"no RequestInfo found in the context");
    };

    if limiter.long_running.is_long_running(info) {
        return next.run(request).await;
    }

    let (gate, kind) = limiter.gate_for(info);
    let Some(gate) = gate else {
        return next.run(request).await;
    };

    match Arc::clone(gate).try_acquire_owned() {
        Ok(permit) => {
            let _slot = InFlightSlot::new(permit, kind);
            next.run(request).await
        }
        Err(_) => {
            let privileged = ctx
                .user()
                .map(|user| user.in_group(&limiter.privileged_group))
                .unwrap_or(false);
            if privileged {
                debug!(uri = %uri, "Admitting privileged request over the in-flight limit");
                return next.run(request).await;
            }
            record_rejection(info, kind);
            responses::too_many_requests()
        }
    }
}
