//! # Audit Events
//!
//! An [`AuditEvent`] is created once per audited request, before the inner
//! handler runs, and then filled in additively as the request progresses.
//! The event's [`Level`] is fixed at creation and only gates which fields are
//! populated:
//!
//! | level            | metadata | response status | request object | response object |
//! |------------------|----------|-----------------|----------------|-----------------|
//! | `Metadata`       | yes      | yes             | no             | no              |
//! | `Request`        | yes      | yes             | yes            | no              |
//! | `RequestResponse`| yes      | yes             | yes            | yes             |

use axum::http::{request::Parts, HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::auth::user::UserInfo;
use crate::request::info::RequestInfo;

/// Header carrying a caller-supplied audit id; echoed on the response
pub const AUDIT_ID_HEADER: &str = "Audit-ID";
pub const IMPERSONATE_USER_HEADER: &str = "Impersonate-User";
pub const IMPERSONATE_GROUP_HEADER: &str = "Impersonate-Group";
pub const IMPERSONATE_EXTRA_HEADER_PREFIX: &str = "Impersonate-Extra-";

/// How much of a request gets recorded. Variant order is the verbosity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Level {
    None,
    #[default]
    Metadata,
    Request,
    RequestResponse,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::None => "None",
            Level::Metadata => "Metadata",
            Level::Request => "Request",
            Level::RequestResponse => "RequestResponse",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point in the request lifecycle at which an event is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    RequestReceived,
    ResponseComplete,
    Panic,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::RequestReceived => "RequestReceived",
            Stage::ResponseComplete => "ResponseComplete",
            Stage::Panic => "Panic",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subresource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(rename = "auditID")]
    pub audit_id: String,
    pub level: Level,
    pub stage: Stage,
    pub request_received_timestamp: DateTime<Utc>,
    pub stage_timestamp: DateTime<Utc>,
    pub verb: String,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    #[serde(rename = "sourceIPs")]
    pub source_ips: Vec<String>,
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_object: Option<serde_json::Value>,
}

impl AuditEvent {
    /// Build the event for an incoming request.
    ///
    /// `user` is the authenticating identity; the impersonated identity is read
    /// from the impersonation headers so both are on record.
    pub fn from_request(
        parts: &Parts,
        info: &RequestInfo,
        user: Option<&UserInfo>,
        level: Level,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let now = Utc::now();
        let audit_id = parts
            .headers
            .get(AUDIT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let object_ref = info.is_resource_request.then(|| ObjectReference {
            resource: info.resource.clone(),
            namespace: info.namespace.clone(),
            name: info.name.clone(),
            api_version: info.group_version(),
            subresource: info.subresource.clone(),
        });

        Self {
            audit_id,
            level,
            stage: Stage::RequestReceived,
            request_received_timestamp: now,
            stage_timestamp: now,
            verb: info.verb.clone(),
            request_uri: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| parts.uri.path().to_string()),
            source_ips: source_ips(&parts.headers, remote_addr),
            user: user.cloned().unwrap_or_default(),
            impersonated_user: impersonated_user_from_headers(&parts.headers),
            object_ref,
            response_status: None,
            request_object: None,
            response_object: None,
        }
    }

    /// Advance to `stage`, refreshing the stage timestamp
    pub fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        self.stage_timestamp = Utc::now();
    }

    /// Record the response code when the level is at least `Metadata`
    pub fn log_response_status(&mut self, code: StatusCode, message: Option<String>) {
        if self.level < Level::Metadata {
            return;
        }
        self.response_status = Some(ResponseStatus {
            code: code.as_u16(),
            message,
        });
    }

    /// Record the request body when the level is at least `Request`
    pub fn log_request_object(&mut self, body: &[u8]) -> Result<(), serde_json::Error> {
        if self.level < Level::Request || body.is_empty() {
            return Ok(());
        }
        self.request_object = Some(serde_json::from_slice(body)?);
        Ok(())
    }

    /// Record the response body, re-encoded as JSON, when the level is `RequestResponse`
    pub fn log_response_object(&mut self, body: &[u8]) -> Result<(), serde_json::Error> {
        if self.level < Level::RequestResponse || body.is_empty() {
            return Ok(());
        }
        self.response_object = Some(serde_json::from_slice(body)?);
        Ok(())
    }
}

fn impersonated_user_from_headers(headers: &HeaderMap) -> Option<UserInfo> {
    let name = headers
        .get(IMPERSONATE_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())?;

    let groups = headers
        .get_all(IMPERSONATE_GROUP_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();

    Some(UserInfo {
        name: name.to_string(),
        uid: String::new(),
        groups,
        extra: impersonated_extra(headers),
    })
}

/// Collect `Impersonate-Extra-<key>` headers; each header may repeat.
pub fn impersonated_extra(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let prefix = IMPERSONATE_EXTRA_HEADER_PREFIX.to_ascii_lowercase();
    let mut extra: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let Some(key) = name.as_str().strip_prefix(prefix.as_str()) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        if let Ok(value) = value.to_str() {
            extra.entry(key.to_string()).or_default().push(value.to_string());
        }
    }
    extra
}

/// Client addresses, nearest proxy last, from forwarding headers and the peer address
pub fn source_ips(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Vec<String> {
    let mut ips: Vec<String> = headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .filter_map(|part| part.trim().parse::<IpAddr>().ok())
                .map(|ip| ip.to_string())
                .collect()
        })
        .unwrap_or_default();

    if ips.is_empty() {
        if let Some(ip) = headers
            .get("X-Real-Ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok())
        {
            ips.push(ip.to_string());
        }
    }

    if let Some(addr) = remote_addr {
        let remote = addr.ip().to_string();
        if !ips.contains(&remote) {
            ips.push(remote);
        }
    }
    ips
}
