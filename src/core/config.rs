//! # Configuration Module
//!
//! Server settings with serde defaults, loaded from YAML and then overridden
//! by `APISERVER_*` environment variables.
//!
//! ## Key Features
//! - Every section has defaults, so an empty file (or no file) is a valid config
//! - Durations are written in human form (`60s`, `5m`) via `humantime-serde`
//! - `validate()` reports every problem at once rather than the first one

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::audit::backend::LogFormat as AuditLogFormat;
use crate::audit::event::Level;
use crate::audit::policy::RulePolicy;
use crate::core::error::{ApiServerError, ApiServerResult};

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener and per-request settings
    pub serving: ServingConfig,

    /// Max-in-flight limits and long-running request classification
    pub admission: AdmissionConfig,

    /// Built-in identity provider settings
    pub authentication: AuthenticationConfig,

    /// Audit policy and backend
    pub audit: AuditConfig,

    /// Background controller settings
    pub controllers: ControllersConfig,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub bind_address: String,
    pub port: u16,

    /// Deadline for requests that are not long-running
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Regular expressions matched against the `Origin` header; empty disables CORS
    pub cors_allowed_origins: Vec<String>,

    /// Group versions served by this instance, e.g. `v1` or `apps/v1`
    pub enabled_group_versions: Vec<String>,

    /// Post-start hooks that are silently skipped when registered
    pub disabled_post_start_hooks: Vec<String>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 6443,
            request_timeout: Duration::from_secs(60),
            cors_allowed_origins: Vec::new(),
            enabled_group_versions: vec![
                "v1".to_string(),
                "apps/v1beta2".to_string(),
                "batch/v1".to_string(),
                "rbac.authorization.k8s.io/v1".to_string(),
            ],
            disabled_post_start_hooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Concurrent non-mutating requests; 0 means unlimited
    pub max_requests_in_flight: usize,

    /// Concurrent mutating requests; 0 means unlimited
    pub max_mutating_requests_in_flight: usize,

    pub long_running_verbs: Vec<String>,
    pub long_running_subresources: Vec<String>,

    /// Members of this group are admitted even when their class is saturated
    pub privileged_group: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests_in_flight: 400,
            max_mutating_requests_in_flight: 200,
            long_running_verbs: vec!["watch".to_string()],
            long_running_subresources: Vec::new(),
            privileged_group: crate::auth::user::SYSTEM_PRIVILEGED_GROUP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    /// Advertise a basic-auth challenge on 401 responses
    pub supports_basic_auth: bool,

    /// Bearer tokens accepted by the static token authenticator; empty disables authentication
    pub static_tokens: Vec<StaticTokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticTokenEntry {
    pub token: String,
    pub user: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,

    /// Rule-based policy; requests matching no rule use its default level
    pub policy: RulePolicy,

    pub log_format: AuditLogFormat,

    /// Capacity of the buffered backend's channel
    pub buffer_size: usize,

    pub max_batch_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: RulePolicy {
                rules: Vec::new(),
                default_level: Level::Metadata,
            },
            log_format: AuditLogFormat::Legacy,
            buffer_size: 10_000,
            max_batch_size: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllersConfig {
    /// Workers draining the auto-registration queue
    pub autoregister_workers: usize,

    /// Workers draining the CRD registration queue
    pub crd_registration_workers: usize,

    /// Re-enqueue every desired entry this often; absent disables resync
    #[serde(with = "humantime_serde")]
    pub resync_period: Option<Duration>,
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            autoregister_workers: 5,
            crd_registration_workers: 1,
            resync_period: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics on `/metrics`
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file, then apply env overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> ApiServerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ApiServerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ApiServerError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus env overrides, for running without a file
    pub fn from_env() -> ApiServerResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Variables follow the pattern `APISERVER_<SECTION>_<FIELD>`,
    /// for example `APISERVER_SERVING_PORT=8443`.
    pub fn apply_env_overrides(&mut self) -> ApiServerResult<()> {
        use std::env;

        if let Ok(addr) = env::var("APISERVER_SERVING_BIND_ADDRESS") {
            self.serving.bind_address = addr;
        }

        if let Ok(port) = env::var("APISERVER_SERVING_PORT") {
            self.serving.port = port
                .parse()
                .map_err(|e| ApiServerError::config(format!("Invalid APISERVER_SERVING_PORT: {}", e)))?;
        }

        if let Ok(timeout) = env::var("APISERVER_SERVING_REQUEST_TIMEOUT") {
            self.serving.request_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                ApiServerError::config(format!("Invalid APISERVER_SERVING_REQUEST_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(limit) = env::var("APISERVER_ADMISSION_MAX_REQUESTS_IN_FLIGHT") {
            self.admission.max_requests_in_flight = limit.parse().map_err(|e| {
                ApiServerError::config(format!("Invalid APISERVER_ADMISSION_MAX_REQUESTS_IN_FLIGHT: {}", e))
            })?;
        }

        if let Ok(limit) = env::var("APISERVER_ADMISSION_MAX_MUTATING_REQUESTS_IN_FLIGHT") {
            self.admission.max_mutating_requests_in_flight = limit.parse().map_err(|e| {
                ApiServerError::config(format!(
                    "Invalid APISERVER_ADMISSION_MAX_MUTATING_REQUESTS_IN_FLIGHT: {}",
                    e
                ))
            })?;
        }

        if let Ok(enabled) = env::var("APISERVER_AUDIT_ENABLED") {
            self.audit.enabled = enabled
                .parse()
                .map_err(|e| ApiServerError::config(format!("Invalid APISERVER_AUDIT_ENABLED: {}", e)))?;
        }

        if let Ok(level) = env::var("APISERVER_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("APISERVER_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ApiServerError::config(format!(
                        "Invalid APISERVER_LOG_FORMAT: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(enabled) = env::var("APISERVER_METRICS_ENABLED") {
            self.metrics.enabled = enabled
                .parse()
                .map_err(|e| ApiServerError::config(format!("Invalid APISERVER_METRICS_ENABLED: {}", e)))?;
        }

        Ok(())
    }

    /// Validate the configuration, collecting every error
    pub fn validate(&self) -> ApiServerResult<()> {
        let mut errors = Vec::new();

        if self.serving.bind_address.is_empty() {
            errors.push("serving.bind_address cannot be empty".to_string());
        }

        if self.serving.request_timeout.is_zero() {
            errors.push("serving.request_timeout must be greater than 0".to_string());
        }

        for origin in &self.serving.cors_allowed_origins {
            if let Err(e) = regex::Regex::new(origin) {
                errors.push(format!("serving.cors_allowed_origins: invalid pattern '{}': {}", origin, e));
            }
        }

        for gv in &self.serving.enabled_group_versions {
            if gv.is_empty() || gv.split('/').count() > 2 {
                errors.push(format!("serving.enabled_group_versions: invalid group version '{}'", gv));
            }
        }

        if self.controllers.autoregister_workers == 0 {
            errors.push("controllers.autoregister_workers must be greater than 0".to_string());
        }

        if self.controllers.crd_registration_workers == 0 {
            errors.push("controllers.crd_registration_workers must be greater than 0".to_string());
        }

        if self.audit.enabled && self.audit.buffer_size == 0 {
            errors.push("audit.buffer_size must be greater than 0".to_string());
        }

        for (index, entry) in self.authentication.static_tokens.iter().enumerate() {
            if entry.token.is_empty() || entry.user.is_empty() {
                errors.push(format!(
                    "authentication.static_tokens[{}]: token and user are required",
                    index
                ));
            }
        }

        if !errors.is_empty() {
            return Err(ApiServerError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// `bind_address:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.serving.bind_address, self.serving.port)
    }
}
