//! # Error Handling Module
//!
//! This module defines every error the API server core can produce, using the
//! `thiserror` crate, and maps each of them onto the HTTP status and the
//! Kubernetes-style `Status` body returned to clients.
//!
//! ## Error Taxonomy
//! - `Unauthorized` (401): the identity provider rejected or could not identify the caller
//! - `Forbidden` (403): the policy provider denied the request
//! - `TooManyRequests` (429): the max-in-flight limiter shed the request
//! - `Timeout` (504): a non-long-running request exceeded its deadline
//! - `Internal` (500): missing request context, serialization failures, panics
//! - `NotFound` / `AlreadyExists` / `Conflict`: object-store outcomes seen by controllers
//!
//! ## Rust Concepts Used
//! - `#[derive(Error)]` implements `Display` and `std::error::Error` from the attributes
//! - `From` impls let `?` convert I/O and serde errors automatically
//! - `IntoResponse` turns an error into an axum `Response` so handlers can return it directly

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use thiserror::Error;

use crate::responses::Status;

/// Main result type used throughout the API server core.
pub type ApiServerResult<T> = Result<T, ApiServerError>;

/// Error types for the API server core
///
/// Each variant corresponds to one Kubernetes `StatusReason`; see [`ApiServerError::reason`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiServerError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Authentication failed or no identity could be established
    #[error("Unauthorized")]
    Unauthorized,

    /// Authorization denied. `message` is the fully formatted denial text.
    #[error("{message}")]
    Forbidden {
        message: String,
        resource: String,
        group: String,
        name: String,
    },

    /// Admission rejected the request because its in-flight class is saturated
    #[error("Too many requests, please try again later.")]
    TooManyRequests { retry_after_seconds: u64 },

    /// Request did not finish within its deadline
    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// The named object does not exist
    #[error("{resource} \"{name}\" not found")]
    NotFound { resource: String, name: String },

    /// The named object already exists
    #[error("{resource} \"{name}\" already exists")]
    AlreadyExists { resource: String, name: String },

    /// The write raced with another writer
    #[error("Operation cannot be fulfilled on {resource} \"{name}\": {message}")]
    Conflict {
        resource: String,
        name: String,
        message: String,
    },

    /// Internal server errors for unexpected failures
    #[error("Internal error occurred: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, listener binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl ApiServerError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a timeout error with a custom message
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn not_found<R: Into<String>, N: Into<String>>(resource: R, name: N) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    pub fn already_exists<R: Into<String>, N: Into<String>>(resource: R, name: N) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Build a forbidden error the way the API machinery phrases it.
    ///
    /// - no resource: `forbidden: <err>`
    /// - no name: `<resource[.group]> is forbidden: <err>`
    /// - otherwise: `<resource[.group]> "<name>" is forbidden: <err>`
    pub fn forbidden(resource: &str, group: &str, name: &str, err: &str) -> Self {
        let group_resource = if group.is_empty() {
            resource.to_string()
        } else {
            format!("{}.{}", resource, group)
        };

        let message = if group_resource.is_empty() {
            format!("forbidden: {}", err)
        } else if name.is_empty() {
            format!("{} is forbidden: {}", group_resource, err)
        } else {
            format!("{} \"{}\" is forbidden: {}", group_resource, name, err)
        };

        Self::Forbidden {
            message,
            resource: resource.to_string(),
            group: group.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyExists { .. } => StatusCode::CONFLICT,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason carried in the `Status` body
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden { .. } => "Forbidden",
            Self::TooManyRequests { .. } => "TooManyRequests",
            Self::Timeout { .. } => "Timeout",
            Self::NotFound { .. } => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Conflict { .. } => "Conflict",
            Self::Json { .. } => "BadRequest",
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => "InternalError",
        }
    }

    /// Short discriminator used in logs and metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Unauthorized => "authentication",
            Self::Forbidden { .. } => "authorization",
            Self::TooManyRequests { .. } => "admission",
            Self::Timeout { .. } => "timeout",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Conflict { .. } => "conflict",
            Self::Internal { .. } => "internal",
            Self::Io { .. } => "io",
            Self::Json { .. } => "json",
            Self::Yaml { .. } => "yaml",
        }
    }

    /// Convert into the `Status` object written on the wire
    pub fn to_status(&self) -> Status {
        let mut status = Status::failure(self.status_code(), self.reason(), self.to_string());
        match self {
            Self::Forbidden {
                resource,
                group,
                name,
                ..
            } => status = status.with_details(name, group, resource),
            Self::NotFound { resource, name }
            | Self::AlreadyExists { resource, name }
            | Self::Conflict { resource, name, .. } => {
                status = status.with_details(name, "", resource)
            }
            _ => {}
        }
        status
    }
}

impl IntoResponse for ApiServerError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        (status_code, Json(self.to_status())).into_response()
    }
}

impl From<Infallible> for ApiServerError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for ApiServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ApiServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ApiServerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<crate::controllers::workqueue::WorkQueueError> for ApiServerError {
    fn from(err: crate::controllers::workqueue::WorkQueueError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<crate::server::hooks::HookError> for ApiServerError {
    fn from(err: crate::server::hooks::HookError) -> Self {
        Self::config(err.to_string())
    }
}

impl From<crate::server::healthz::HealthzError> for ApiServerError {
    fn from(err: crate::server::healthz::HealthzError) -> Self {
        Self::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_message_variants() {
        let err = ApiServerError::forbidden("", "", "", "User \"bob\" cannot get path \"/logs\".");
        assert_eq!(err.to_string(), "forbidden: User \"bob\" cannot get path \"/logs\".");

        let err = ApiServerError::forbidden("deployments", "apps", "", "denied");
        assert_eq!(err.to_string(), "deployments.apps is forbidden: denied");

        let err = ApiServerError::forbidden("pods", "", "web-0", "denied");
        assert_eq!(err.to_string(), "pods \"web-0\" is forbidden: denied");
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(ApiServerError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiServerError::forbidden("pods", "", "", "x").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiServerError::TooManyRequests { retry_after_seconds: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiServerError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiServerError::timeout("late").status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn error_type_labels_follow_taxonomy() {
        assert_eq!(ApiServerError::Unauthorized.error_type(), "authentication");
        assert_eq!(
            ApiServerError::TooManyRequests { retry_after_seconds: 1 }.error_type(),
            "admission"
        );
        assert_eq!(
            ApiServerError::already_exists("apiservices", "v1.apps").error_type(),
            "already_exists"
        );
        assert_eq!(ApiServerError::internal("etcd down").error_type(), "internal");
    }

    #[test]
    fn status_body_carries_reason_and_details() {
        let status = ApiServerError::not_found("apiservices", "v1.apps").to_status();
        assert_eq!(status.code, 404);
        assert_eq!(status.reason, "NotFound");
        let details = status.details.expect("details");
        assert_eq!(details.name, "v1.apps");
        assert_eq!(details.kind, "apiservices");
    }
}
