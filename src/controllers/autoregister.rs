//! # API Service Auto-Registration
//!
//! Keeps the APIService store in line with a desired set maintained by other
//! components through [`AutoApiServiceRegistration`]. Keys are APIService names.
//!
//! | observed | desired | action                              |
//! |----------|---------|-------------------------------------|
//! | absent   | absent  | nothing                             |
//! | absent   | present | create                              |
//! | present  | absent  | delete, but only if automanaged      |
//! | present  | present | update the spec unless it is equal  |

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controllers::apiregistration::{
    ApiService, ApiServiceClient, ApiServiceEvent, ApiServiceLister, AUTO_MANAGED_LABEL,
};
use crate::controllers::reconciler::{Controller, ErrorSink, LogErrorSink, Reconciler};
use crate::controllers::workqueue::{RateLimitingQueue, WorkQueueError};
use crate::core::error::ApiServerResult;

pub const AUTOREGISTER_QUEUE: &str = "autoregister";

/// Accepts APIServices that should exist
pub trait AutoApiServiceRegistration: Send + Sync {
    fn add_api_service_to_sync(&self, service: ApiService);
    fn remove_api_service_to_sync(&self, name: &str);
}

pub struct AutoRegisterController {
    lister: Arc<dyn ApiServiceLister>,
    client: Arc<dyn ApiServiceClient>,
    desired: RwLock<HashMap<String, ApiService>>,
    queue: Arc<RateLimitingQueue<String>>,
    errors: RwLock<Arc<dyn ErrorSink>>,
}

impl AutoRegisterController {
    pub fn new(lister: Arc<dyn ApiServiceLister>, client: Arc<dyn ApiServiceClient>) -> Arc<Self> {
        Arc::new(Self {
            lister,
            client,
            desired: RwLock::new(HashMap::new()),
            queue: Arc::new(RateLimitingQueue::with_default_limiter(AUTOREGISTER_QUEUE)),
            errors: RwLock::new(Arc::new(LogErrorSink)),
        })
    }

    pub fn set_error_sink(&self, errors: Arc<dyn ErrorSink>) {
        *self.errors.write() = errors;
    }

    pub fn queue(&self) -> Arc<RateLimitingQueue<String>> {
        Arc::clone(&self.queue)
    }

    pub fn desired_api_service(&self, name: &str) -> Option<ApiService> {
        self.desired.read().get(name).cloned()
    }

    /// Names of every desired APIService, sorted
    pub fn desired_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.desired.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueue every desired name
    pub fn resync(&self) {
        for name in self.desired_names() {
            self.queue.add(name);
        }
    }

    pub fn handle_event(&self, event: &ApiServiceEvent) {
        debug!(name = %event.name(), "APIService changed");
        self.queue.add(event.name().to_string());
    }

    /// Enqueue the name of every observed change until `stop` fires
    pub fn watch(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ApiServiceEvent>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => controller.handle_event(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "APIService events dropped, resyncing");
                            controller.resync();
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        })
    }

    /// Reconcile a single APIService by name
    pub async fn check_api_service(&self, name: &str) -> ApiServerResult<()> {
        let desired = self.desired_api_service(name);
        let current = match self.lister.get(name) {
            Ok(current) => Some(current),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match (current, desired) {
            (None, None) => Ok(()),
            (None, Some(desired)) => {
                info!(name = %name, "Creating APIService");
                self.client.create(desired).await.map(|_| ())
            }
            (Some(current), None) => {
                if !current.is_automanaged() {
                    return Ok(());
                }
                info!(name = %name, "Deleting APIService");
                self.client.delete(name).await
            }
            (Some(current), Some(desired)) if current.spec == desired.spec => Ok(()),
            (Some(mut current), Some(desired)) => {
                info!(name = %name, "Updating APIService");
                current.spec = desired.spec;
                self.client.update(current).await.map(|_| ())
            }
        }
    }

    /// Run `workers` reconcilers until `stop` fires, optionally re-enqueueing
    /// every desired name each `resync_period`
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        resync_period: Option<Duration>,
        stop: CancellationToken,
    ) -> Result<(), WorkQueueError> {
        let lister = Arc::clone(&self.lister);
        let errors = self.errors.read().clone();
        let controller = Controller::new(
            AUTOREGISTER_QUEUE,
            Arc::clone(&self.queue),
            Arc::clone(&self) as Arc<dyn Reconciler<String>>,
        )
        .with_cache_synced(Arc::new(move || lister.has_synced()))
        .with_error_sink(errors);

        if let Some(period) = resync_period {
            let this = Arc::clone(&self);
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = ticker.tick() => this.resync(),
                    }
                }
            });
        }

        controller.run(workers, stop).await
    }
}

impl AutoApiServiceRegistration for AutoRegisterController {
    fn add_api_service_to_sync(&self, service: ApiService) {
        let mut service = service;
        service
            .metadata
            .labels
            .insert(AUTO_MANAGED_LABEL.to_string(), "true".to_string());
        let name = service.name().to_string();
        self.desired.write().insert(name.clone(), service);
        self.queue.add(name);
    }

    fn remove_api_service_to_sync(&self, name: &str) {
        self.desired.write().remove(name);
        self.queue.add(name.to_string());
    }
}

#[async_trait]
impl Reconciler<String> for AutoRegisterController {
    async fn reconcile(&self, key: &String) -> ApiServerResult<()> {
        self.check_api_service(key).await
    }
}
