//! # Server Assembly
//!
//! [`GenericApiServer`] collects everything the server serves: resource
//! routes, discovery documents, health checks and post-start hooks.
//! [`GenericApiServer::prepare_run`] seals registration and wraps the routes
//! in the handler chain; [`PreparedApiServer::run`] then serves until the stop
//! token fires.
//!
//! ## Run sequence
//! 1. start the audit backend
//! 2. launch post-start hooks
//! 3. serve with graceful shutdown on the stop token
//! 4. after the token has fired, shut the audit backend down

pub mod healthz;
pub mod hooks;
pub mod routes;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::backend::AuditBackend;
use crate::controllers::apiregistration::GroupVersion;
use crate::core::config::ServerConfig;
use crate::core::error::{ApiServerError, ApiServerResult};
use crate::middleware::chain::{Collaborators, HandlerChain};

pub use healthz::{HealthzChecker, HealthzError, HealthzRegistry, NamedCheck, PingHealthz};
pub use hooks::{HookError, HookFailureHandler, PostStartHookContext, PostStartHookRegistry};
pub use routes::{PathRecorder, VersionInfo};

pub struct GenericApiServer {
    config: ServerConfig,
    collaborators: Collaborators,
    healthz: Arc<HealthzRegistry>,
    hooks: Arc<PostStartHookRegistry>,
    paths: Arc<PathRecorder>,
    version: Option<VersionInfo>,
    metrics: Option<PrometheusHandle>,
    api_routes: Router,
}

impl GenericApiServer {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> ApiServerResult<Self> {
        let enabled: Vec<GroupVersion> = config
            .serving
            .enabled_group_versions
            .iter()
            .map(|gv| GroupVersion::parse(gv))
            .collect();
        let (api_routes, discovery_paths) = routes::discovery_routes(&enabled);

        let paths = Arc::new(PathRecorder::new());
        paths.register_all(discovery_paths);

        let healthz = Arc::new(HealthzRegistry::new());
        let hooks = Arc::new(PostStartHookRegistry::new(
            Arc::clone(&healthz),
            config.serving.disabled_post_start_hooks.iter().cloned(),
        ));

        Ok(Self {
            config,
            collaborators,
            healthz,
            hooks,
            paths,
            version: None,
            metrics: None,
            api_routes,
        })
    }

    /// Serve `/version` with this build information
    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = Some(version);
        self
    }

    /// Serve `/metrics` from this recorder
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hooks(&self) -> Arc<PostStartHookRegistry> {
        Arc::clone(&self.hooks)
    }

    pub fn healthz(&self) -> Arc<HealthzRegistry> {
        Arc::clone(&self.healthz)
    }

    pub fn add_post_start_hook<F, Fut>(&self, name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(PostStartHookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiServerResult<()>> + Send + 'static,
    {
        self.hooks.add_post_start_hook(name, hook)
    }

    pub fn add_healthz_checks(&self, checks: Vec<Arc<dyn HealthzChecker>>) -> Result<(), HealthzError> {
        self.healthz.add_checks(checks)
    }

    /// Mount resource handlers; `paths` are listed by the index
    pub fn install_api_routes<I, S>(&mut self, paths: I, router: Router)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths.register_all(paths);
        let current = std::mem::take(&mut self.api_routes);
        self.api_routes = current.merge(router);
    }

    /// Every path installed so far
    pub fn listed_paths(&self) -> Vec<String> {
        self.paths.paths()
    }

    /// Seal health-check registration and build the served router
    pub fn prepare_run(self) -> ApiServerResult<PreparedApiServer> {
        let mut router = self.api_routes;

        let healthz_routes = self.healthz.install();
        self.paths.register_all(self.healthz.paths());
        router = router.merge(healthz_routes);

        if let Some(version) = self.version {
            router = router.merge(routes::version_routes(version));
            self.paths.register("/version");
        }
        if let Some(handle) = self.metrics {
            router = router.merge(routes::metrics_routes(handle));
            self.paths.register("/metrics");
        }
        self.paths.register_all(["/", "/index.html"]);
        router = router
            .merge(routes::index_routes(Arc::clone(&self.paths)))
            .fallback(routes::not_found);

        let chain = HandlerChain::new(&self.config, &self.collaborators)?;
        let router = chain.apply(router).layer(TraceLayer::new_for_http());

        info!(paths = self.paths.paths().len(), "API server prepared");

        Ok(PreparedApiServer {
            router,
            hooks: self.hooks,
            audit_backend: self.collaborators.audit_backend,
            address: self.config.listen_address(),
        })
    }
}

pub struct PreparedApiServer {
    router: Router,
    hooks: Arc<PostStartHookRegistry>,
    audit_backend: Option<Arc<dyn AuditBackend>>,
    address: String,
}

impl PreparedApiServer {
    /// The fully wrapped router
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn hooks(&self) -> Arc<PostStartHookRegistry> {
        Arc::clone(&self.hooks)
    }

    pub async fn run(self, stop: CancellationToken) -> ApiServerResult<()> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            ApiServerError::internal(format!("Failed to bind to {}: {}", self.address, e))
        })?;
        self.run_with_listener(listener, stop).await
    }

    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        stop: CancellationToken,
    ) -> ApiServerResult<()> {
        if let Some(backend) = &self.audit_backend {
            backend.run(stop.clone())?;
            info!(backend = backend.name(), "Audit backend started");
        }

        self.hooks.run_post_start_hooks(stop.clone());

        let local_addr = listener.local_addr()?;
        info!("Serving securely on {}", local_addr);

        let served = axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .await;

        // Backends drain only once nothing else can deliver.
        stop.cancel();
        if let Some(backend) = &self.audit_backend {
            backend.shutdown().await;
            info!(backend = backend.name(), "Audit backend stopped");
        }

        served.map_err(|e| ApiServerError::internal(format!("Server error: {}", e)))
    }
}
