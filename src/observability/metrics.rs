//! # Metrics
//!
//! Counters and gauges emitted by the request pipeline, the audit pipeline and
//! the work queues, recorded through the `metrics` facade. The binary installs
//! a Prometheus recorder and serves it on `/metrics`; without a recorder every
//! call here is a cheap no-op, which keeps tests free of global state.
//!
//! ## Metric Families
//! - `authenticated_user_requests{username}`: bucketed, never raw user names
//! - `apiserver_request_count{verb,resource,subresource,scope,code}`
//! - `apiserver_dropped_requests{request_kind}`
//! - `apiserver_current_inflight_requests{request_kind}`
//! - `apiserver_audit_event_total`, `apiserver_audit_error_total{plugin}`, `apiserver_audit_level_total{level}`
//! - `workqueue_depth{name}`, `workqueue_adds_total{name}`, `workqueue_retries_total{name}`,
//!   `workqueue_work_duration_seconds{name}`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::core::error::{ApiServerError, ApiServerResult};

/// Internal identities reported under their own name
const VERBATIM_USERNAMES: [&str; 5] = [
    "admin",
    "client",
    "kube_proxy",
    "kubelet",
    "system:serviceaccount:kube-system:default",
];

pub const EMAIL_BUCKET: &str = "email_id";
pub const OTHER_BUCKET: &str = "other";

pub const READ_ONLY_KIND: &str = "readOnly";
pub const MUTATING_KIND: &str = "mutating";

/// Reduce a user name to a low-cardinality label value
pub fn compress_username(username: &str) -> &str {
    if VERBATIM_USERNAMES.contains(&username) {
        username
    } else if username.contains('@') {
        EMAIL_BUCKET
    } else {
        OTHER_BUCKET
    }
}

/// Install the Prometheus recorder and return the handle used to render `/metrics`
pub fn install_prometheus_recorder() -> ApiServerResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0],
        )
        .map_err(|e| ApiServerError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| ApiServerError::config(format!("Failed to install metrics recorder: {}", e)))
}

pub fn record_authenticated_user(username: &str) {
    metrics::counter!(
        "authenticated_user_requests",
        "username" => compress_username(username).to_string()
    )
    .increment(1);
}

/// Count a request outcome, labelled the way the request was resolved
pub fn monitor_request(verb: &str, resource: &str, subresource: &str, scope: &str, code: u16) {
    metrics::counter!(
        "apiserver_request_count",
        "verb" => verb.to_ascii_uppercase(),
        "resource" => resource.to_string(),
        "subresource" => subresource.to_string(),
        "scope" => scope.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

pub fn record_dropped_request(request_kind: &'static str) {
    metrics::counter!("apiserver_dropped_requests", "request_kind" => request_kind).increment(1);
}

pub fn adjust_inflight(request_kind: &'static str, delta: f64) {
    metrics::gauge!("apiserver_current_inflight_requests", "request_kind" => request_kind)
        .increment(delta);
}

pub fn record_audit_event(level: &'static str) {
    metrics::counter!("apiserver_audit_event_total").increment(1);
    metrics::counter!("apiserver_audit_level_total", "level" => level).increment(1);
}

pub fn record_audit_error(plugin: &str, count: u64) {
    metrics::counter!("apiserver_audit_error_total", "plugin" => plugin.to_string()).increment(count);
}

pub fn set_workqueue_depth(name: &str, depth: usize) {
    metrics::gauge!("workqueue_depth", "name" => name.to_string()).set(depth as f64);
}

pub fn record_workqueue_add(name: &str) {
    metrics::counter!("workqueue_adds_total", "name" => name.to_string()).increment(1);
}

pub fn record_workqueue_retry(name: &str) {
    metrics::counter!("workqueue_retries_total", "name" => name.to_string()).increment(1);
}

pub fn record_workqueue_work_duration(name: &str, duration: Duration) {
    metrics::histogram!("workqueue_work_duration_seconds", "name" => name.to_string())
        .record(duration.as_secs_f64());
}
