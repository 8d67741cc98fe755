//! # Health Checks
//!
//! Named checks served under `/healthz`:
//!
//! - `GET /healthz`: `ok`, or with `?verbose` one `[+]name ok` / `[-]name failed: reason withheld`
//!   line per check; any failing check turns the response into a 500
//! - `GET /healthz/<name>`: a single check; `<name>` may contain slashes,
//!   as in `/healthz/poststarthook/<hook>`
//!
//! Checks can only be added until the endpoints are installed; afterwards the set is frozen.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// A named readiness check. `Err` carries the failure reason, which is never sent to clients.
pub trait HealthzChecker: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthzError {
    #[error("unable to add because the healthz endpoint has already been created")]
    AlreadyInstalled,

    #[error("healthz check {name:?} is already registered")]
    Duplicate { name: String },
}

/// Always healthy; installed when nothing else is registered
pub struct PingHealthz;

impl HealthzChecker for PingHealthz {
    fn name(&self) -> &str {
        "ping"
    }

    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Check backed by a closure
pub struct NamedCheck<F> {
    name: String,
    check: F,
}

impl<F> NamedCheck<F>
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    pub fn new<S: Into<String>>(name: S, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> HealthzChecker for NamedCheck<F>
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<(), String> {
        (self.check)()
    }
}

#[derive(Default)]
pub struct HealthzRegistry {
    checks: RwLock<Vec<Arc<dyn HealthzChecker>>>,
    installed: AtomicBool,
}

impl HealthzRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_checks(&self, checks: Vec<Arc<dyn HealthzChecker>>) -> Result<(), HealthzError> {
        let mut current = self.checks.write();
        if self.installed.load(Ordering::SeqCst) {
            return Err(HealthzError::AlreadyInstalled);
        }
        for check in &checks {
            let name = check.name();
            if current.iter().any(|c| c.name() == name) {
                return Err(HealthzError::Duplicate {
                    name: name.to_string(),
                });
            }
        }
        current.extend(checks);
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Names of the check paths, e.g. `/healthz/ping`
    pub fn paths(&self) -> Vec<String> {
        let checks = self.checks.read();
        let mut paths = vec!["/healthz".to_string()];
        if checks.is_empty() {
            paths.push("/healthz/ping".to_string());
        }
        paths.extend(checks.iter().map(|c| format!("/healthz/{}", c.name())));
        paths
    }

    /// Freeze the check set and return the `/healthz` routes
    pub fn install(&self) -> Router {
        let snapshot = {
            let mut checks = self.checks.write();
            self.installed.store(true, Ordering::SeqCst);
            if checks.is_empty() {
                checks.push(Arc::new(PingHealthz));
            }
            checks.clone()
        };

        let by_name: HashMap<String, Arc<dyn HealthzChecker>> = snapshot
            .iter()
            .map(|c| (c.name().to_string(), Arc::clone(c)))
            .collect();
        let state = Arc::new(InstalledChecks {
            ordered: snapshot,
            by_name,
        });

        Router::new()
            .route("/healthz", get(root_handler))
            .route("/healthz/*name", get(check_handler))
            .with_state(state)
    }
}

struct InstalledChecks {
    ordered: Vec<Arc<dyn HealthzChecker>>,
    by_name: HashMap<String, Arc<dyn HealthzChecker>>,
}

async fn root_handler(
    State(checks): State<Arc<InstalledChecks>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let mut failed = false;
    let mut verbose_out = String::new();
    for check in &checks.ordered {
        match check.check() {
            Ok(()) => verbose_out.push_str(&format!("[+]{} ok\n", check.name())),
            Err(reason) => {
                warn!(check = check.name(), reason = %reason, "healthz check failed");
                verbose_out.push_str(&format!("[-]{} failed: reason withheld\n", check.name()));
                failed = true;
            }
        }
    }

    if failed {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}healthz check failed\n", verbose_out),
        )
            .into_response();
    }

    if !query.contains_key("verbose") {
        return (StatusCode::OK, "ok").into_response();
    }

    (StatusCode::OK, format!("{}healthz check passed\n", verbose_out)).into_response()
}

async fn check_handler(
    State(checks): State<Arc<InstalledChecks>>,
    Path(name): Path<String>,
) -> Response {
    let Some(check) = checks.by_name.get(name.trim_start_matches('/')) else {
        return (StatusCode::NOT_FOUND, format!("healthz check {:?} not found\n", name)).into_response();
    };
    match check.check() {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("internal server error: {}\n", reason),
        )
            .into_response(),
    }
}
