//! # CRD Registration
//!
//! Keeps one APIService desired for every group version served by at least
//! one custom resource definition. Keys are group versions; each sync asks the
//! CRD cache whether the version is still served and adds or removes the
//! matching APIService on the auto-registration side.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controllers::apiregistration::{ApiService, GroupVersion};
use crate::controllers::autoregister::AutoApiServiceRegistration;
use crate::controllers::reconciler::{wait_for_cache_sync, Controller, InformerSynced, Reconciler};
use crate::controllers::workqueue::{RateLimitingQueue, WorkQueueError};
use crate::core::error::ApiServerResult;

pub const CRD_REGISTRATION_QUEUE: &str = "crd-autoregister";

/// Priorities given to APIServices created for custom resources
pub const CRD_GROUP_PRIORITY_MINIMUM: i32 = 1000;
pub const CRD_VERSION_PRIORITY: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResourceDefinitionVersion {
    pub name: String,
    pub served: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResourceDefinitionSpec {
    pub group: String,
    pub versions: Vec<CustomResourceDefinitionVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResourceDefinition {
    pub name: String,
    pub spec: CustomResourceDefinitionSpec,
}

impl CustomResourceDefinition {
    /// Group versions this definition serves
    pub fn served_group_versions(&self) -> impl Iterator<Item = GroupVersion> + '_ {
        self.spec
            .versions
            .iter()
            .filter(|v| v.served)
            .map(move |v| GroupVersion::new(self.spec.group.clone(), v.name.clone()))
    }

    /// Every group version mentioned, served or not
    pub fn group_versions(&self) -> impl Iterator<Item = GroupVersion> + '_ {
        self.spec
            .versions
            .iter()
            .map(move |v| GroupVersion::new(self.spec.group.clone(), v.name.clone()))
    }
}

/// Read side of the CRD cache
pub trait CrdLister: Send + Sync {
    fn list(&self) -> ApiServerResult<Vec<CustomResourceDefinition>>;
    fn has_synced(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrdEvent {
    Added(CustomResourceDefinition),
    Updated {
        old: CustomResourceDefinition,
        new: CustomResourceDefinition,
    },
    Deleted(CustomResourceDefinition),
}

/// CRD cache backed by a map, with change notifications
pub struct InMemoryCrdStore {
    objects: RwLock<BTreeMap<String, CustomResourceDefinition>>,
    synced: AtomicBool,
    events: broadcast::Sender<CrdEvent>,
}

impl Default for InMemoryCrdStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            synced: AtomicBool::new(false),
            events,
        }
    }
}

impl InMemoryCrdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrdEvent> {
        self.events.subscribe()
    }

    pub fn upsert(&self, crd: CustomResourceDefinition) {
        let old = self.objects.write().insert(crd.name.clone(), crd.clone());
        let event = match old {
            Some(old) => CrdEvent::Updated { old, new: crd },
            None => CrdEvent::Added(crd),
        };
        let _ = self.events.send(event);
    }

    pub fn remove(&self, name: &str) {
        if let Some(removed) = self.objects.write().remove(name) {
            let _ = self.events.send(CrdEvent::Deleted(removed));
        }
    }
}

impl CrdLister for InMemoryCrdStore {
    fn list(&self) -> ApiServerResult<Vec<CustomResourceDefinition>> {
        Ok(self.objects.read().values().cloned().collect())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

pub struct CrdRegistrationController {
    crds: Arc<dyn CrdLister>,
    registration: Arc<dyn AutoApiServiceRegistration>,
    queue: Arc<RateLimitingQueue<GroupVersion>>,
}

impl CrdRegistrationController {
    pub fn new(
        crds: Arc<dyn CrdLister>,
        registration: Arc<dyn AutoApiServiceRegistration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            crds,
            registration,
            queue: Arc::new(RateLimitingQueue::with_default_limiter(CRD_REGISTRATION_QUEUE)),
        })
    }

    pub fn queue(&self) -> Arc<RateLimitingQueue<GroupVersion>> {
        Arc::clone(&self.queue)
    }

    pub fn handle_event(&self, event: &CrdEvent) {
        match event {
            CrdEvent::Added(crd) | CrdEvent::Deleted(crd) => self.enqueue_crd(crd),
            CrdEvent::Updated { old, new } => {
                self.enqueue_crd(old);
                self.enqueue_crd(new);
            }
        }
    }

    fn enqueue_crd(&self, crd: &CustomResourceDefinition) {
        for gv in crd.group_versions() {
            debug!(group_version = %gv, crd = %crd.name, "Queueing CRD group version");
            self.queue.add(gv);
        }
    }

    /// Enqueue the group versions of every observed change until `stop` fires
    pub fn watch(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<CrdEvent>,
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
                            warn!(missed, "CRD events dropped, resyncing");
                            if let Err(e) = controller.enqueue_all() {
                                warn!(error = %e, "Unable to list CRDs for resync");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        })
    }

    /// Enqueue every group version currently in the cache
    pub fn enqueue_all(&self) -> ApiServerResult<()> {
        for crd in self.crds.list()? {
            self.enqueue_crd(&crd);
        }
        Ok(())
    }

    /// Add or remove the APIService for `gv` depending on whether a CRD serves it
    pub fn handle_version_update(&self, gv: &GroupVersion) -> ApiServerResult<()> {
        let served = self
            .crds
            .list()?
            .iter()
            .any(|crd| crd.served_group_versions().any(|served| &served == gv));

        if served {
            self.registration.add_api_service_to_sync(ApiService::local(
                gv,
                CRD_GROUP_PRIORITY_MINIMUM,
                CRD_VERSION_PRIORITY,
            ));
        } else {
            self.registration
                .remove_api_service_to_sync(&gv.api_service_name());
        }
        Ok(())
    }

    /// Seed the queue once the cache is synced, then reconcile until `stop` fires
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        stop: CancellationToken,
    ) -> Result<(), WorkQueueError> {
        let crds = Arc::clone(&self.crds);
        let controller = Controller::new(
            CRD_REGISTRATION_QUEUE,
            Arc::clone(&self.queue),
            Arc::clone(&self) as Arc<dyn Reconciler<GroupVersion>>,
        )
        .with_cache_synced(Arc::new(move || crds.has_synced()));

        let seeding = {
            let this = Arc::clone(&self);
            let stop = stop.clone();
            tokio::spawn(async move {
                let crds = Arc::clone(&this.crds);
                let synced: [InformerSynced; 1] = [Arc::new(move || crds.has_synced())];
                if wait_for_cache_sync(CRD_REGISTRATION_QUEUE, &synced, &stop).await {
                    if let Err(e) = this.enqueue_all() {
                        warn!(error = %e, "Unable to list CRDs");
                    }
                }
            })
        };

        let result = controller.run(workers, stop).await;
        seeding.abort();
        result
    }
}

#[async_trait]
impl Reconciler<GroupVersion> for CrdRegistrationController {
    async fn reconcile(&self, key: &GroupVersion) -> ApiServerResult<()> {
        self.handle_version_update(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<ApiService>>,
        removed: Mutex<Vec<String>>,
    }

    impl AutoApiServiceRegistration for Recorder {
        fn add_api_service_to_sync(&self, service: ApiService) {
            self.added.lock().push(service);
        }

        fn remove_api_service_to_sync(&self, name: &str) {
            self.removed.lock().push(name.to_string());
        }
    }

    fn crd(name: &str, group: &str, versions: &[(&str, bool)]) -> CustomResourceDefinition {
        CustomResourceDefinition {
            name: name.to_string(),
            spec: CustomResourceDefinitionSpec {
                group: group.to_string(),
                versions: versions
                    .iter()
                    .map(|(v, served)| CustomResourceDefinitionVersion {
                        name: v.to_string(),
                        served: *served,
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn served_version_is_registered_with_crd_priorities() {
        let store = Arc::new(InMemoryCrdStore::new());
        store.upsert(crd("widgets.example.com", "example.com", &[("v1", true), ("v2", false)]));
        let recorder = Arc::new(Recorder::default());
        let controller = CrdRegistrationController::new(store, recorder.clone());

        controller
            .handle_version_update(&GroupVersion::new("example.com", "v1"))
            .unwrap();
        let added = recorder.added.lock();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name(), "v1.example.com");
        assert_eq!(added[0].spec.group_priority_minimum, 1000);
        assert_eq!(added[0].spec.version_priority, 100);
        drop(added);

        controller
            .handle_version_update(&GroupVersion::new("example.com", "v2"))
            .unwrap();
        assert_eq!(*recorder.removed.lock(), vec!["v2.example.com".to_string()]);
    }

    #[test]
    fn update_enqueues_old_and_new_versions() {
        let store = Arc::new(InMemoryCrdStore::new());
        let controller = CrdRegistrationController::new(store, Arc::new(Recorder::default()));
        controller.handle_event(&CrdEvent::Updated {
            old: crd("w", "example.com", &[("v1", true)]),
            new: crd("w", "example.com", &[("v2", true)]),
        });
        assert_eq!(controller.queue().len(), 2);
    }
}
