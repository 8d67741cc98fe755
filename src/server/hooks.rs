//! # Post-Start Hooks
//!
//! One-shot initialisation tasks that run once the server starts serving.
//! Every hook gets a `poststarthook/<name>` health check that fails with
//! `not finished` until the hook completes.
//!
//! ## Lifecycle
//! - hooks register while the registry is open; empty and duplicate names are rejected
//! - [`PostStartHookRegistry::run_post_start_hooks`] closes registration and spawns every hook
//! - a hook either succeeds or takes the process down: an error or a panic is
//!   handed to the failure handler, which by default logs and exits

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::error::ApiServerError;
use crate::middleware::panic_recovery::panic_message;
use crate::server::healthz::{HealthzChecker, HealthzError, HealthzRegistry};

/// What a hook receives when it starts
#[derive(Clone)]
pub struct PostStartHookContext {
    /// Fires when the server is shutting down
    pub stop: CancellationToken,
}

pub type PostStartHookFn =
    Arc<dyn Fn(PostStartHookContext) -> BoxFuture<'static, Result<(), ApiServerError>> + Send + Sync>;

/// Called when a hook fails; the default logs and exits the process
pub type HookFailureHandler = Arc<dyn Fn(&str, &ApiServerError) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("missing name")]
    MissingName,

    #[error("unable to add {0:?} because PostStartHooks have already been called")]
    AlreadyCalled(String),

    #[error("unable to add {0:?} because it is already registered")]
    AlreadyRegistered(String),

    #[error(transparent)]
    Healthz(#[from] HealthzError),
}

struct HookEntry {
    hook: PostStartHookFn,
    done: Arc<AtomicBool>,
}

#[derive(Default)]
struct RegistryState {
    hooks: BTreeMap<String, HookEntry>,
    called: bool,
}

/// Fails until its hook has completed
struct PostStartHookCheck {
    name: String,
    done: Arc<AtomicBool>,
}

impl HealthzChecker for PostStartHookCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<(), String> {
        if self.done.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("not finished".to_string())
        }
    }
}

fn exit_on_failure(name: &str, err: &ApiServerError) {
    error!(hook = name, error = %err, "PostStartHook {:?} failed: {}", name, err);
    std::process::exit(1);
}

pub struct PostStartHookRegistry {
    state: Mutex<RegistryState>,
    disabled: HashSet<String>,
    healthz: Arc<HealthzRegistry>,
    on_failure: RwLock<HookFailureHandler>,
}

impl PostStartHookRegistry {
    pub fn new(healthz: Arc<HealthzRegistry>, disabled: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            disabled: disabled.into_iter().collect(),
            healthz,
            on_failure: RwLock::new(Arc::new(exit_on_failure)),
        }
    }

    /// Replace the failure handler (the default terminates the process)
    pub fn set_failure_handler(&self, handler: HookFailureHandler) {
        *self.on_failure.write() = handler;
    }

    pub fn add_post_start_hook<F, Fut>(&self, name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(PostStartHookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ApiServerError>> + Send + 'static,
    {
        let hook: PostStartHookFn = Arc::new(move |ctx| hook(ctx).boxed());
        self.add_boxed(name, hook)
    }

    pub fn add_boxed(&self, name: &str, hook: PostStartHookFn) -> Result<(), HookError> {
        if name.is_empty() {
            return Err(HookError::MissingName);
        }
        if self.disabled.contains(name) {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.called {
            return Err(HookError::AlreadyCalled(name.to_string()));
        }
        if state.hooks.contains_key(name) {
            return Err(HookError::AlreadyRegistered(name.to_string()));
        }

        let done = Arc::new(AtomicBool::new(false));
        self.healthz.add_checks(vec![Arc::new(PostStartHookCheck {
            name: format!("poststarthook/{}", name),
            done: Arc::clone(&done),
        })])?;
        state.hooks.insert(name.to_string(), HookEntry { hook, done });
        Ok(())
    }

    pub fn has_been_called(&self) -> bool {
        self.state.lock().called
    }

    /// Names of registered hooks, sorted
    pub fn names(&self) -> Vec<String> {
        self.state.lock().hooks.keys().cloned().collect()
    }

    /// Whether the named hook finished successfully
    pub fn is_done(&self, name: &str) -> bool {
        self.state
            .lock()
            .hooks
            .get(name)
            .map(|entry| entry.done.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Close registration and start every hook on its own task
    pub fn run_post_start_hooks(&self, stop: CancellationToken) {
        let mut state = self.state.lock();
        state.called = true;
        let on_failure = self.on_failure.read().clone();

        for (name, entry) in state.hooks.iter() {
            let name = name.clone();
            let hook = Arc::clone(&entry.hook);
            let done = Arc::clone(&entry.done);
            let on_failure = Arc::clone(&on_failure);
            let ctx = PostStartHookContext { stop: stop.clone() };

            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(async move { hook(ctx).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {
                        done.store(true, Ordering::SeqCst);
                        info!(hook = %name, "PostStartHook completed");
                    }
                    Ok(Err(err)) => on_failure(&name, &err),
                    Err(payload) => {
                        let err = ApiServerError::internal(format!(
                            "panic: {}",
                            panic_message(payload.as_ref())
                        ));
                        on_failure(&name, &err);
                    }
                }
            });
        }
    }
}
