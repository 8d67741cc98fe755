//! # RequestInfo Resolution
//!
//! Parses a request path into the verb/group/version/resource/namespace/name
//! tuple that authorization, auditing and admission reason about.
//!
//! Resource paths look like:
//! ```text
//! /api/{version}/{resource}
//! /api/{version}/{resource}/{name}
//! /api/{version}/namespaces/{namespace}/{resource}/{name}/{subresource}
//! /apis/{group}/{version}/namespaces/{namespace}/{resource}
//! /apis/{group}/{version}/watch/namespaces/{namespace}/{resource}
//! ```
//! Anything else is a non-resource request whose verb is the lower-cased method.

use serde::Serialize;
use std::collections::HashSet;

use crate::core::error::{ApiServerError, ApiServerResult};

/// Verbs that never change state
pub const NON_MUTATING_VERBS: [&str; 3] = ["get", "list", "watch"];

/// Path segments that carry the verb when they follow the version
const SPECIAL_VERBS: [&str; 2] = ["proxy", "watch"];

/// Subresources of `namespaces/{name}` that keep the namespace as the resource
const NAMESPACE_SUBRESOURCES: [&str; 2] = ["status", "finalize"];

/// Parsed metadata about a request; immutable once resolved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub is_resource_request: bool,
    pub path: String,
    pub verb: String,
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    /// Path segments after the version, with any namespace prefix removed
    pub parts: Vec<String>,
}

impl RequestInfo {
    pub fn non_resource(method: &str, path: &str) -> Self {
        Self {
            is_resource_request: false,
            path: path.to_string(),
            verb: method.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    pub fn is_mutating(&self) -> bool {
        !NON_MUTATING_VERBS.contains(&self.verb.as_str())
    }

    /// `group/version`, or just `version` for the legacy group
    pub fn group_version(&self) -> String {
        if self.api_group.is_empty() {
            self.api_version.clone()
        } else {
            format!("{}/{}", self.api_group, self.api_version)
        }
    }
}

/// Resolves [`RequestInfo`] from method, path and query
#[derive(Debug, Clone)]
pub struct RequestInfoResolver {
    api_prefixes: HashSet<String>,
    groupless_api_prefixes: HashSet<String>,
}

impl Default for RequestInfoResolver {
    fn default() -> Self {
        Self::new(["api", "apis"], ["api"])
    }
}

impl RequestInfoResolver {
    pub fn new<I, J, S, T>(api_prefixes: I, groupless_api_prefixes: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            api_prefixes: api_prefixes.into_iter().map(Into::into).collect(),
            groupless_api_prefixes: groupless_api_prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve a request. Fails only for malformed special-verb paths such as `/api/v1/watch`.
    pub fn resolve(&self, method: &str, path: &str, query: Option<&str>) -> ApiServerResult<RequestInfo> {
        let mut info = RequestInfo::non_resource(method, path);

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let mut parts: &[&str] = &segments;
        if parts.is_empty() || parts[0].is_empty() {
            return Ok(info);
        }

        if !self.api_prefixes.contains(parts[0]) {
            return Ok(info);
        }
        info.api_prefix = parts[0].to_string();
        parts = &parts[1..];

        if !self.groupless_api_prefixes.contains(&info.api_prefix) {
            // one part (/apis/<group>) is group discovery, not a resource
            if parts.len() < 2 {
                return Ok(info);
            }
            info.api_group = parts[0].to_string();
            parts = &parts[1..];
        }

        if parts.is_empty() {
            return Ok(info);
        }
        info.api_version = parts[0].to_string();
        parts = &parts[1..];

        // /api/v1 and /apis/<group>/<version> are version discovery
        if parts.is_empty() {
            return Ok(info);
        }

        info.is_resource_request = true;

        if SPECIAL_VERBS.contains(&parts[0]) {
            if parts.len() < 2 {
                return Err(ApiServerError::internal(format!(
                    "unable to determine kind and namespace from url, {}",
                    path
                )));
            }
            info.verb = parts[0].to_string();
            parts = &parts[1..];
        } else {
            info.verb = match method {
                "POST" => "create",
                "GET" | "HEAD" => "get",
                "PUT" => "update",
                "PATCH" => "patch",
                "DELETE" => "delete",
                _ => "",
            }
            .to_string();
        }

        if parts[0] == "namespaces" {
            if parts.len() > 1 {
                info.namespace = parts[1].to_string();
                // /namespaces/{name} and /namespaces/{name}/status address the namespace itself
                if parts.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&parts[2]) {
                    parts = &parts[2..];
                }
            }
        }

        info.parts = parts.iter().map(|p| p.to_string()).collect();
        if parts.len() >= 3 {
            info.subresource = parts[2].to_string();
        }
        if parts.len() >= 2 {
            info.name = parts[1].to_string();
        }
        if !parts.is_empty() {
            info.resource = parts[0].to_string();
        }

        if info.name.is_empty() && info.verb == "get" {
            info.verb = "list".to_string();
        }

        if info.verb == "list" {
            let options = ListOptions::parse(query);
            if options.watch {
                info.verb = "watch".to_string();
            }
            if let Some(name) = options.field_name {
                info.name = name;
            }
        } else if info.verb == "watch" && info.name.is_empty() {
            if let Some(name) = ListOptions::parse(query).field_name {
                info.name = name;
            }
        }

        if info.name.is_empty() && info.verb == "delete" {
            info.verb = "deletecollection".to_string();
        }

        Ok(info)
    }
}

/// The few list options that influence request info
#[derive(Debug, Default)]
struct ListOptions {
    watch: bool,
    field_name: Option<String>,
}

impl ListOptions {
    fn parse(query: Option<&str>) -> Self {
        let mut options = Self::default();
        let Some(query) = query else {
            return options;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "watch" => options.watch = parse_bool(&value),
                "fieldSelector" => {
                    options.field_name = value.split(',').find_map(|term| {
                        let (field, name) = term.split_once('=')?;
                        let field = field.trim_end_matches('=');
                        (field == "metadata.name").then(|| name.trim_start_matches('=').to_string())
                    });
                }
                _ => {}
            }
        }
        options
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

/// Decides which requests are long-running (watches, streaming subresources)
#[derive(Debug, Clone)]
pub struct LongRunningCheck {
    verbs: HashSet<String>,
    subresources: HashSet<String>,
}

impl Default for LongRunningCheck {
    fn default() -> Self {
        Self::new(["watch"], Vec::<String>::new())
    }
}

impl LongRunningCheck {
    pub fn new<I, J, S, T>(verbs: I, subresources: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            verbs: verbs.into_iter().map(Into::into).collect(),
            subresources: subresources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_long_running(&self, info: &RequestInfo) -> bool {
        if self.verbs.contains(&info.verb) {
            return true;
        }
        info.is_resource_request && self.subresources.contains(&info.subresource)
    }
}
