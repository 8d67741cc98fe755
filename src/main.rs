//! # API Server - Main Entry Point
//!
//! Loads configuration, wires the identity, policy and audit collaborators
//! into the handler chain, registers the auto-registration post-start hooks
//! and serves until SIGTERM or SIGINT.
//!
//! Usage: `apiserver [CONFIG_PATH]`. Without a path the defaults are used,
//! overridden by `APISERVER_*` environment variables.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use apiserver_core::audit::backend::{AuditBackend, BufferSettings, BufferedBackend, LogBackend};
use apiserver_core::audit::event::Level;
use apiserver_core::audit::policy::{AuditPolicy, FixedLevelPolicy};
use apiserver_core::auth::authenticator::{Authenticator, StaticTokenAuthenticator};
use apiserver_core::auth::authorizer::AlwaysAllowAuthorizer;
use apiserver_core::controllers::{
    api_services_to_register, ApiVersionPriorities, AutoRegisterController,
    CrdRegistrationController, InMemoryApiServiceStore, InMemoryCrdStore,
};
use apiserver_core::observability::{init_logging, install_prometheus_recorder};
use apiserver_core::server::VersionInfo;
use apiserver_core::{Collaborators, GenericApiServer, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().await?;
    init_logging(&config.logging)?;

    info!("🚀 Starting API server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let stop = CancellationToken::new();
    let server = build_server(config)?;
    let prepared = server.prepare_run()?;

    let mut serving = tokio::spawn(prepared.run(stop.clone()));

    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut serving => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            info!("🛑 Shutdown signal received, beginning graceful shutdown...");
            stop.cancel();
            serving.await
        }
    };

    match result {
        Ok(Ok(())) => info!("✅ API server shutdown complete"),
        Ok(Err(e)) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            error!("🚨 Server task failed: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}

async fn load_config() -> anyhow::Result<ServerConfig> {
    match std::env::args().nth(1) {
        Some(path) => ServerConfig::load_from_file(&path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => ServerConfig::from_env().context("Failed to load configuration from environment"),
    }
}

fn build_collaborators(config: &ServerConfig) -> Collaborators {
    let authenticator: Option<Arc<dyn Authenticator>> =
        if config.authentication.static_tokens.is_empty() {
            None
        } else {
            Some(Arc::new(StaticTokenAuthenticator::from_entries(
                &config.authentication.static_tokens,
            )))
        };

    let (audit_backend, audit_policy): (Option<Arc<dyn AuditBackend>>, Arc<dyn AuditPolicy>) =
        if config.audit.enabled {
            let delegate = Arc::new(LogBackend::new(config.audit.log_format));
            let backend = BufferedBackend::new(
                delegate,
                BufferSettings {
                    buffer_size: config.audit.buffer_size,
                    max_batch_size: config.audit.max_batch_size,
                },
            );
            (Some(Arc::new(backend)), Arc::new(config.audit.policy.clone()))
        } else {
            (None, Arc::new(FixedLevelPolicy(Level::None)))
        };

    Collaborators {
        authenticator,
        authorizer: Some(Arc::new(AlwaysAllowAuthorizer)),
        audit_backend,
        audit_policy,
    }
}

fn build_server(config: ServerConfig) -> anyhow::Result<GenericApiServer> {
    let collaborators = build_collaborators(&config);
    let metrics_enabled = config.metrics.enabled;
    let controllers = config.controllers.clone();

    let mut server =
        GenericApiServer::new(config, collaborators)?.with_version(VersionInfo::from_build());
    if metrics_enabled {
        server = server.with_metrics(install_prometheus_recorder()?);
    }

    let api_services = Arc::new(InMemoryApiServiceStore::new());
    let autoregister = AutoRegisterController::new(api_services.clone(), api_services.clone());
    let registered = api_services_to_register(
        &server.listed_paths(),
        autoregister.as_ref(),
        &ApiVersionPriorities::default(),
    );
    info!(count = registered.len(), "📋 Local APIServices queued for registration");

    {
        let api_services = Arc::clone(&api_services);
        let autoregister = Arc::clone(&autoregister);
        let controllers = controllers.clone();
        server.add_post_start_hook("kube-apiserver-autoregistration", move |ctx| {
            let api_services = Arc::clone(&api_services);
            let autoregister = Arc::clone(&autoregister);
            let controllers = controllers.clone();
            async move {
                let _watcher = autoregister.watch(api_services.subscribe(), ctx.stop.clone());
                api_services.mark_synced();
                tokio::spawn(async move {
                    if let Err(e) = autoregister
                        .run(
                            controllers.autoregister_workers,
                            controllers.resync_period,
                            ctx.stop,
                        )
                        .await
                    {
                        error!("Autoregister controller stopped: {}", e);
                    }
                });
                Ok(())
            }
        })?;
    }

    let crds = Arc::new(InMemoryCrdStore::new());
    let crd_registration = CrdRegistrationController::new(crds.clone(), autoregister);
    server.add_post_start_hook("crd-registration-controller", move |ctx| {
        let crds = Arc::clone(&crds);
        let crd_registration = Arc::clone(&crd_registration);
        let workers = controllers.crd_registration_workers;
        async move {
            let _watcher = crd_registration.watch(crds.subscribe(), ctx.stop.clone());
            crds.mark_synced();
            tokio::spawn(async move {
                if let Err(e) = crd_registration.run(workers, ctx.stop).await {
                    error!("CRD registration controller stopped: {}", e);
                }
            });
            Ok(())
        }
    })?;

    Ok(server)
}

async fn shutdown_signal() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("📡 Received SIGTERM, initiating graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("📡 Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
            Err(e) => {
                error!("Failed to install SIGINT handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = terminate => {}
        _ = interrupt => {}
    }
}
