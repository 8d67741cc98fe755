//! Built-in endpoints: the path index, `/version`, API discovery and `/metrics`.

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::controllers::apiregistration::GroupVersion;
use crate::responses::Status;

/// Every path installed on the server, listed by `/` and `/index.html`
#[derive(Debug, Default)]
pub struct PathRecorder {
    paths: RwLock<BTreeSet<String>>,
}

impl PathRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(&self, path: S) {
        self.paths.write().insert(path.into());
    }

    pub fn register_all<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut current = self.paths.write();
        current.extend(paths.into_iter().map(Into::into));
    }

    /// Sorted
    pub fn paths(&self) -> Vec<String> {
        self.paths.read().iter().cloned().collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RootPaths {
    pub paths: Vec<String>,
}

pub fn index_routes(recorder: Arc<PathRecorder>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/index.html", get(index_handler))
        .with_state(recorder)
}

async fn index_handler(State(recorder): State<Arc<PathRecorder>>) -> Json<RootPaths> {
    Json(RootPaths {
        paths: recorder.paths(),
    })
}

/// Build information served at `/version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub major: String,
    pub minor: String,
    pub git_version: String,
    #[serde(default)]
    pub git_commit: String,
    #[serde(default)]
    pub build_date: String,
    pub platform: String,
}

impl VersionInfo {
    /// Version of this crate as built
    pub fn from_build() -> Self {
        let version = env!("CARGO_PKG_VERSION");
        let mut parts = version.split('.');
        Self {
            major: parts.next().unwrap_or_default().to_string(),
            minor: parts.next().unwrap_or_default().to_string(),
            git_version: format!("v{}", version),
            git_commit: String::new(),
            build_date: String::new(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

pub fn version_routes(info: VersionInfo) -> Router {
    Router::new()
        .route("/version", get(version_handler))
        .with_state(Arc::new(info))
}

async fn version_handler(State(info): State<Arc<VersionInfo>>) -> Json<VersionInfo> {
    Json(info.as_ref().clone())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVersions {
    kind: String,
    versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupVersionForDiscovery {
    group_version: String,
    version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiGroup {
    name: String,
    versions: Vec<GroupVersionForDiscovery>,
    preferred_version: GroupVersionForDiscovery,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiGroupList {
    kind: String,
    api_version: String,
    groups: Vec<ApiGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResourceList {
    kind: String,
    group_version: String,
    resources: Vec<serde_json::Value>,
}

/// Discovery documents for the enabled group versions, plus the path of every
/// document installed. The first listed version of a group is its preferred one.
pub fn discovery_routes(enabled: &[GroupVersion]) -> (Router, Vec<String>) {
    let mut router = Router::new();
    let mut paths = Vec::new();

    let legacy: Vec<String> = enabled
        .iter()
        .filter(|gv| gv.group.is_empty())
        .map(|gv| gv.version.clone())
        .collect();
    if !legacy.is_empty() {
        let body = Arc::new(ApiVersions {
            kind: "APIVersions".to_string(),
            versions: legacy,
        });
        router = router.route(
            "/api",
            get(move || {
                let body = Arc::clone(&body);
                async move { Json(serde_json::json!(*body)) }
            }),
        );
        paths.push("/api".to_string());
    }

    let mut groups: Vec<ApiGroup> = Vec::new();
    for gv in enabled.iter().filter(|gv| !gv.group.is_empty()) {
        let entry = GroupVersionForDiscovery {
            group_version: gv.to_string(),
            version: gv.version.clone(),
        };
        match groups.iter_mut().find(|g| g.name == gv.group) {
            Some(group) => group.versions.push(entry),
            None => groups.push(ApiGroup {
                name: gv.group.clone(),
                versions: vec![entry.clone()],
                preferred_version: entry,
            }),
        }
    }
    if !groups.is_empty() {
        for group in &groups {
            paths.push(format!("/apis/{}", group.name));
        }
        let body = Arc::new(ApiGroupList {
            kind: "APIGroupList".to_string(),
            api_version: "v1".to_string(),
            groups,
        });
        router = router.route(
            "/apis",
            get(move || {
                let body = Arc::clone(&body);
                async move { Json(serde_json::json!(*body)) }
            }),
        );
        paths.push("/apis".to_string());
    }

    for gv in enabled {
        let path = gv.api_path();
        let body = Arc::new(ApiResourceList {
            kind: "APIResourceList".to_string(),
            group_version: gv.to_string(),
            resources: Vec::new(),
        });
        router = router.route(
            &path,
            get(move || {
                let body = Arc::clone(&body);
                async move { Json(serde_json::json!(*body)) }
            }),
        );
        paths.push(path);
    }

    (router, paths)
}

pub fn metrics_routes(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

/// 404 for anything no route matched
pub async fn not_found(uri: Uri) -> Response {
    let status = Status::failure(
        StatusCode::NOT_FOUND,
        "NotFound",
        "the server could not find the requested resource".to_string(),
    );
    tracing::debug!(uri = %uri, "No route for request");
    (StatusCode::NOT_FOUND, Json(status)).into_response()
}
