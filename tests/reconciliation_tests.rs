//! # Reconciliation Integration Tests
//!
//! Runs the auto-registration and CRD registration controllers against the
//! in-memory APIService store and checks the store converges on the desired
//! set: after registration, after external tampering, after transient write
//! failures and when CRD versions stop being served.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use apiserver_core::controllers::apiregistration::{ApiServiceClient, ApiServiceLister};
use apiserver_core::controllers::crdregistration::{
    CustomResourceDefinition, CustomResourceDefinitionSpec, CustomResourceDefinitionVersion,
};
use apiserver_core::controllers::{
    api_services_to_register, ApiService, ApiVersionPriorities, AutoApiServiceRegistration,
    AutoRegisterController, CrdRegistrationController, ErrorSink, GroupVersion,
    InMemoryApiServiceStore, InMemoryCrdStore, WorkQueueError,
};
use apiserver_core::{ApiServerError, ApiServerResult};

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn names(store: &InMemoryApiServiceStore) -> Vec<String> {
    store.snapshot().iter().map(|s| s.name().to_string()).collect()
}

#[derive(Default)]
struct RecordingSink {
    errors: Mutex<Vec<(String, String)>>,
}

impl ErrorSink for RecordingSink {
    fn handle_error(&self, _controller: &str, key: &str, err: &ApiServerError) {
        self.errors.lock().push((key.to_string(), err.to_string()));
    }
}

/// Writes through to the store after failing the first `failures` creates
struct FlakyClient {
    store: Arc<InMemoryApiServiceStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl ApiServiceClient for FlakyClient {
    async fn create(&self, service: ApiService) -> ApiServerResult<ApiService> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ApiServerError::internal("etcd unavailable"));
        }
        self.store.create(service).await
    }

    async fn update(&self, service: ApiService) -> ApiServerResult<ApiService> {
        self.store.update(service).await
    }

    async fn delete(&self, name: &str) -> ApiServerResult<()> {
        self.store.delete(name).await
    }
}

#[tokio::test]
async fn autoregister_converges_and_repairs_tampering() {
    let store = Arc::new(InMemoryApiServiceStore::new());
    let controller = AutoRegisterController::new(store.clone(), store.clone());
    let stop = CancellationToken::new();

    let listed: Vec<String> = ["/api/v1", "/apis/apps/v1beta2", "/apis/batch/v1", "/apis/example.com/v1"]
        .iter()
        .map(|p| p.to_string())
        .collect();
    let queued = api_services_to_register(&listed, controller.as_ref(), &ApiVersionPriorities::default());
    assert_eq!(queued.len(), 3);

    let _watcher = controller.watch(store.subscribe(), stop.clone());
    store.mark_synced();
    let running = tokio::spawn(Arc::clone(&controller).run(2, None, stop.clone()));

    eventually("initial registration", || {
        names(&store) == vec!["v1.", "v1.batch", "v1beta2.apps"]
    })
    .await;
    assert!(store.snapshot().iter().all(ApiService::is_automanaged));

    // someone deletes a managed service behind the controller's back
    store.delete("v1.batch").await.unwrap();
    eventually("recreated v1.batch", || store.get("v1.batch").is_ok()).await;

    // someone edits the spec of a managed service
    let mut edited = store.get("v1.").unwrap();
    edited.spec.group_priority_minimum = 1;
    store.update(edited).await.unwrap();
    eventually("restored priority", || {
        store
            .get("v1.")
            .map(|s| s.spec.group_priority_minimum == 18000)
            .unwrap_or(false)
    })
    .await;

    controller.remove_api_service_to_sync("v1beta2.apps");
    eventually("removed v1beta2.apps", || store.get("v1beta2.apps").is_err()).await;

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_writes_are_retried_and_reported() {
    let store = Arc::new(InMemoryApiServiceStore::new());
    let client = Arc::new(FlakyClient {
        store: store.clone(),
        failures: AtomicUsize::new(3),
    });
    let controller = AutoRegisterController::new(store.clone(), client);
    let sink = Arc::new(RecordingSink::default());
    controller.set_error_sink(sink.clone());
    let stop = CancellationToken::new();

    controller.add_api_service_to_sync(ApiService::local(&GroupVersion::new("batch", "v1"), 17400, 15));
    store.mark_synced();
    let running = tokio::spawn(Arc::clone(&controller).run(1, None, stop.clone()));

    eventually("v1.batch after retries", || store.get("v1.batch").is_ok()).await;

    let errors = sink.errors.lock().clone();
    assert_eq!(errors.len(), 3);
    assert!(errors
        .iter()
        .all(|(key, err)| key.contains("v1.batch") && err.contains("etcd unavailable")));
    // success forgets the backoff history
    let queue = controller.queue();
    eventually("forgotten backoff", || queue.num_requeues(&"v1.batch".to_string()) == 0).await;

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn crd_versions_drive_api_services() {
    let api_services = Arc::new(InMemoryApiServiceStore::new());
    let autoregister = AutoRegisterController::new(api_services.clone(), api_services.clone());
    let crds = Arc::new(InMemoryCrdStore::new());
    let crd_registration = CrdRegistrationController::new(crds.clone(), autoregister.clone());
    let stop = CancellationToken::new();

    crds.upsert(CustomResourceDefinition {
        name: "widgets.example.com".to_string(),
        spec: CustomResourceDefinitionSpec {
            group: "example.com".to_string(),
            versions: vec![
                CustomResourceDefinitionVersion {
                    name: "v1".to_string(),
                    served: true,
                },
                CustomResourceDefinitionVersion {
                    name: "v2alpha1".to_string(),
                    served: false,
                },
            ],
        },
    });

    let _api_watch = autoregister.watch(api_services.subscribe(), stop.clone());
    let _crd_watch = crd_registration.watch(crds.subscribe(), stop.clone());
    api_services.mark_synced();
    crds.mark_synced();
    let autoregistering = tokio::spawn(Arc::clone(&autoregister).run(1, None, stop.clone()));
    let registering = tokio::spawn(Arc::clone(&crd_registration).run(1, stop.clone()));

    eventually("v1.example.com", || api_services.get("v1.example.com").is_ok()).await;
    let service = api_services.get("v1.example.com").unwrap();
    assert_eq!(service.spec.group_priority_minimum, 1000);
    assert_eq!(service.spec.version_priority, 100);
    assert!(api_services.get("v2alpha1.example.com").is_err());

    crds.remove("widgets.example.com");
    eventually("v1.example.com removed", || api_services.get("v1.example.com").is_err()).await;
    assert!(autoregister.desired_names().is_empty());

    stop.cancel();
    autoregistering.await.unwrap().unwrap();
    registering.await.unwrap().unwrap();
}

#[tokio::test]
async fn unsynced_cache_fails_on_stop() {
    let store = Arc::new(InMemoryApiServiceStore::new());
    let controller = AutoRegisterController::new(store.clone(), store.clone());
    let stop = CancellationToken::new();

    let running = tokio::spawn(Arc::clone(&controller).run(1, None, stop.clone()));
    sleep(Duration::from_millis(250)).await;
    stop.cancel();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(WorkQueueError::CacheSyncFailed { .. })));
    assert!(controller.queue().is_shutting_down());
}
