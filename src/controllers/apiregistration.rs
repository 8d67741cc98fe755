//! # API Service Registration Types
//!
//! The `APIService` object the registration controllers manage, the read
//! ([`ApiServiceLister`]) and write ([`ApiServiceClient`]) sides of the object
//! store, and [`InMemoryApiServiceStore`], which implements both and
//! broadcasts every change.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::error::{ApiServerError, ApiServerResult};

/// Label marking services owned by the auto-registration controller
pub const AUTO_MANAGED_LABEL: &str = "kube-aggregator.kubernetes.io/automanaged";

const RESOURCE: &str = "apiservices";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn new<G: Into<String>, V: Into<String>>(group: G, version: V) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }

    /// `apps/v1` or, for the legacy group, `v1`
    pub fn parse(value: &str) -> Self {
        match value.split_once('/') {
            Some((group, version)) => Self::new(group, version),
            None => Self::new("", value),
        }
    }

    /// Discovery path: `/api/<v>` for the legacy group, else `/apis/<g>/<v>`
    pub fn api_path(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    /// Name of the APIService for this group version
    pub fn api_service_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.version)
        } else {
            write!(f, "{}/{}", self.group, self.version)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServiceSpec {
    /// `None` means the group is served locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,
    pub group: String,
    pub version: String,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    pub group_priority_minimum: i32,
    pub version_priority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiService {
    pub metadata: ObjectMeta,
    pub spec: ApiServiceSpec,
}

impl ApiService {
    /// A locally served APIService for `gv` with the given priorities
    pub fn local(gv: &GroupVersion, group_priority_minimum: i32, version_priority: i32) -> Self {
        Self {
            metadata: ObjectMeta {
                name: gv.api_service_name(),
                ..Default::default()
            },
            spec: ApiServiceSpec {
                service: None,
                group: gv.group.clone(),
                version: gv.version.clone(),
                insecure_skip_tls_verify: false,
                group_priority_minimum,
                version_priority,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_automanaged(&self) -> bool {
        self.metadata.labels.contains_key(AUTO_MANAGED_LABEL)
    }
}

/// Equality match on labels; empty selects everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Read side: a cache of observed APIServices
pub trait ApiServiceLister: Send + Sync {
    fn get(&self, name: &str) -> ApiServerResult<ApiService>;
    fn list(&self, selector: &LabelSelector) -> ApiServerResult<Vec<ApiService>>;
    /// Whether the cache has completed its initial fill
    fn has_synced(&self) -> bool;
}

/// Write side of the APIService store
#[async_trait]
pub trait ApiServiceClient: Send + Sync {
    async fn create(&self, service: ApiService) -> ApiServerResult<ApiService>;
    async fn update(&self, service: ApiService) -> ApiServerResult<ApiService>;
    async fn delete(&self, name: &str) -> ApiServerResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiServiceEvent {
    Added(ApiService),
    Updated { old: ApiService, new: ApiService },
    Deleted(ApiService),
}

impl ApiServiceEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Added(service) | Self::Deleted(service) => service.name(),
            Self::Updated { new, .. } => new.name(),
        }
    }
}

/// Store and cache in one; starts unsynced
pub struct InMemoryApiServiceStore {
    objects: RwLock<BTreeMap<String, ApiService>>,
    synced: AtomicBool,
    resource_version: AtomicU64,
    events: broadcast::Sender<ApiServiceEvent>,
}

impl Default for InMemoryApiServiceStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            synced: AtomicBool::new(false),
            resource_version: AtomicU64::new(0),
            events,
        }
    }
}

impl InMemoryApiServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApiServiceEvent> {
        self.events.subscribe()
    }

    /// Every stored object, sorted by name
    pub fn snapshot(&self) -> Vec<ApiService> {
        self.objects.read().values().cloned().collect()
    }

    fn next_version(&self) -> u64 {
        self.resource_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event: ApiServiceEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl ApiServiceLister for InMemoryApiServiceStore {
    fn get(&self, name: &str) -> ApiServerResult<ApiService> {
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ApiServerError::not_found(RESOURCE, name))
    }

    fn list(&self, selector: &LabelSelector) -> ApiServerResult<Vec<ApiService>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|service| selector.matches(&service.metadata.labels))
            .cloned()
            .collect())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApiServiceClient for InMemoryApiServiceStore {
    async fn create(&self, mut service: ApiService) -> ApiServerResult<ApiService> {
        {
            let mut objects = self.objects.write();
            if objects.contains_key(service.name()) {
                return Err(ApiServerError::already_exists(RESOURCE, service.name()));
            }
            service.metadata.resource_version = self.next_version();
            objects.insert(service.name().to_string(), service.clone());
        }
        debug!(name = %service.name(), "APIService created");
        self.publish(ApiServiceEvent::Added(service.clone()));
        Ok(service)
    }

    async fn update(&self, mut service: ApiService) -> ApiServerResult<ApiService> {
        let old = {
            let mut objects = self.objects.write();
            let Some(current) = objects.get(service.name()) else {
                return Err(ApiServerError::not_found(RESOURCE, service.name()));
            };
            if service.metadata.resource_version != 0
                && service.metadata.resource_version != current.metadata.resource_version
            {
                return Err(ApiServerError::Conflict {
                    resource: RESOURCE.to_string(),
                    name: service.name().to_string(),
                    message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
                });
            }
            service.metadata.resource_version = self.next_version();
            objects.insert(service.name().to_string(), service.clone())
        };
        debug!(name = %service.name(), "APIService updated");
        if let Some(old) = old {
            self.publish(ApiServiceEvent::Updated {
                old,
                new: service.clone(),
            });
        }
        Ok(service)
    }

    async fn delete(&self, name: &str) -> ApiServerResult<()> {
        let removed = self
            .objects
            .write()
            .remove(name)
            .ok_or_else(|| ApiServerError::not_found(RESOURCE, name))?;
        debug!(name = %name, "APIService deleted");
        self.publish(ApiServiceEvent::Deleted(removed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_version_forms() {
        let core = GroupVersion::parse("v1");
        assert_eq!(core.api_path(), "/api/v1");
        assert_eq!(core.api_service_name(), "v1.");
        assert_eq!(core.to_string(), "v1");

        let apps = GroupVersion::parse("apps/v1");
        assert_eq!(apps.api_path(), "/apis/apps/v1");
        assert_eq!(apps.api_service_name(), "v1.apps");
        assert_eq!(apps.to_string(), "apps/v1");
    }

    #[test]
    fn selector_matches_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(AUTO_MANAGED_LABEL.to_string(), "true".to_string());
        let mut selector = LabelSelector::everything();
        assert!(selector.matches(&BTreeMap::new()));
        selector
            .match_labels
            .insert(AUTO_MANAGED_LABEL.to_string(), "true".to_string());
        assert!(selector.matches(&labels));
        assert!(!selector.matches(&BTreeMap::new()));
    }

    #[tokio::test]
    async fn store_round_trip_and_events() {
        let store = InMemoryApiServiceStore::new();
        let mut events = store.subscribe();
        let service = ApiService::local(&GroupVersion::new("apps", "v1"), 17800, 15);

        let created = store.create(service.clone()).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);
        assert!(store.create(service).await.unwrap_err().is_already_exists());
        assert!(matches!(events.recv().await.unwrap(), ApiServiceEvent::Added(_)));

        let mut changed = created.clone();
        changed.spec.version_priority = 20;
        store.update(changed).await.unwrap();
        assert_eq!(store.get("v1.apps").unwrap().spec.version_priority, 20);

        let stale = created;
        assert!(matches!(
            store.update(stale).await,
            Err(ApiServerError::Conflict { .. })
        ));

        store.delete("v1.apps").await.unwrap();
        assert!(store.get("v1.apps").unwrap_err().is_not_found());
        assert!(store.delete("v1.apps").await.unwrap_err().is_not_found());
    }
}
