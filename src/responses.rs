//! # Response Writers
//!
//! Canonical responses written by the request pipeline: the `Status` object,
//! plain-text internal errors, denial messages and the load-shedding reply.
//! Every message that echoes request data back to a client is HTML-escaped first.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::auth::authorizer::Attributes;
use crate::core::error::ApiServerError;

/// Body written when a panic escapes the pipeline
pub const PANIC_MESSAGE: &str = "This request caused apiserver to panic. Look in log for details.";

/// Body written with a 429 admission rejection
pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests, please try again later.";

/// Seconds advertised in `Retry-After` on admission rejection
pub const RETRY_AFTER_SECONDS: u64 = 1;

/// Kubernetes-style status object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: String,
    pub api_version: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: String,
    pub message: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    pub code: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl Status {
    pub fn failure(code: StatusCode, reason: &str, message: String) -> Self {
        Self {
            kind: "Status".to_string(),
            api_version: "v1".to_string(),
            metadata: serde_json::Map::new(),
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            details: None,
            code: code.as_u16(),
        }
    }

    pub fn with_details(mut self, name: &str, group: &str, kind: &str) -> Self {
        self.details = Some(StatusDetails {
            name: name.to_string(),
            group: group.to_string(),
            kind: kind.to_string(),
        });
        self
    }
}

/// Escape the characters that would let echoed request data render as markup.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

fn plain_text(status: StatusCode, body: String) -> Response {
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// 500 for pipeline defects and provider errors. Full detail belongs in the log; the
/// client sees the sanitized URI and error text only.
pub fn internal_error(uri: &str, err: &dyn std::fmt::Display) -> Response {
    plain_text(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!(
            "Internal Server Error: \"{}\": {}",
            sanitize(uri),
            sanitize(&err.to_string())
        ),
    )
}

/// Generic 500 written when a panic reaches the outermost stage
pub fn panic_response() -> Response {
    plain_text(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{}\n", PANIC_MESSAGE),
    )
}

/// 429 with a `Retry-After` hint
pub fn too_many_requests() -> Response {
    let err = ApiServerError::TooManyRequests {
        retry_after_seconds: RETRY_AFTER_SECONDS,
    };
    let mut response = plain_text(err.status_code(), format!("{}\n", err));
    if let ApiServerError::TooManyRequests {
        retry_after_seconds,
    } = err
    {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
    }
    response
}

/// 401 with an optional basic-auth challenge
pub fn unauthorized(supports_basic_auth: bool) -> Response {
    let mut response = ApiServerError::Unauthorized.into_response();
    if supports_basic_auth {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"kubernetes-master\""),
        );
    }
    response
}

/// Human-readable denial naming the identity, verb and target. Names are
/// quoted with escaping, so embedded quotes and control characters stay
/// unambiguous.
pub fn forbidden_message(attributes: &Attributes) -> String {
    let username = attributes.username();

    if !attributes.is_resource_request {
        return format!(
            "User {:?} cannot {} path {:?}.",
            username, attributes.verb, attributes.path
        );
    }

    let mut resource = attributes.resource.clone();
    if !attributes.api_group.is_empty() {
        resource = format!("{}.{}", resource, attributes.api_group);
    }
    if !attributes.subresource.is_empty() {
        resource = format!("{}/{}", resource, attributes.subresource);
    }

    if !attributes.namespace.is_empty() {
        format!(
            "User {:?} cannot {} {} in the namespace {:?}.",
            username, attributes.verb, resource, attributes.namespace
        )
    } else {
        format!(
            "User {:?} cannot {} {} at the cluster scope.",
            username, attributes.verb, resource
        )
    }
}

/// Build the 403 error for a denied request; `reason` comes from the policy provider.
pub fn forbidden_error(attributes: &Attributes, reason: &str) -> ApiServerError {
    let message = sanitize(&forbidden_message(attributes));
    let err = if reason.is_empty() {
        message
    } else {
        format!("{}: {:?}", message, reason)
    };
    ApiServerError::forbidden(
        &attributes.resource,
        &attributes.api_group,
        &attributes.name,
        &err,
    )
}

/// Empty-bodied response carrying only a status code
pub fn status_only(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::user::UserInfo;

    fn attributes(resource_request: bool) -> Attributes {
        Attributes {
            user: Some(UserInfo::new("alice")),
            verb: "list".to_string(),
            is_resource_request: resource_request,
            path: "/apis/apps/v1/namespaces/prod/deployments".to_string(),
            api_group: "apps".to_string(),
            api_version: "v1".to_string(),
            resource: "deployments".to_string(),
            subresource: String::new(),
            namespace: "prod".to_string(),
            name: String::new(),
        }
    }

    #[test]
    fn non_resource_message_names_path() {
        let mut attrs = attributes(false);
        attrs.verb = "get".to_string();
        attrs.path = "/logs".to_string();
        assert_eq!(forbidden_message(&attrs), "User \"alice\" cannot get path \"/logs\".");
    }

    #[test]
    fn namespaced_message_names_namespace() {
        assert_eq!(
            forbidden_message(&attributes(true)),
            "User \"alice\" cannot list deployments.apps in the namespace \"prod\"."
        );
    }

    #[test]
    fn cluster_scoped_message_with_subresource() {
        let mut attrs = attributes(true);
        attrs.namespace.clear();
        attrs.api_group.clear();
        attrs.resource = "nodes".to_string();
        attrs.subresource = "status".to_string();
        attrs.verb = "update".to_string();
        assert_eq!(
            forbidden_message(&attrs),
            "User \"alice\" cannot update nodes/status at the cluster scope."
        );
    }

    #[test]
    fn forbidden_error_appends_reason_and_escapes() {
        let mut attrs = attributes(false);
        attrs.path = "/<script>".to_string();
        attrs.verb = "get".to_string();
        let err = forbidden_error(&attrs, "no rule");
        assert_eq!(
            err.to_string(),
            "forbidden: User \"alice\" cannot get path \"/&lt;script&gt;\".: \"no rule\""
        );
    }

    #[test]
    fn names_with_quotes_are_escaped() {
        let mut attrs = attributes(true);
        attrs.user = Some(UserInfo::new("eve\" cannot nothing"));
        attrs.namespace = "tab\there".to_string();
        assert_eq!(
            forbidden_message(&attrs),
            "User \"eve\\\" cannot nothing\" cannot list deployments.apps in the namespace \"tab\\there\"."
        );
    }

    #[test]
    fn sanitize_escapes_markup() {
        assert_eq!(sanitize("a&b<c>"), "a&amp;b&lt;c&gt;");
    }

    #[test]
    fn too_many_requests_has_retry_after() {
        let response = too_many_requests();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
