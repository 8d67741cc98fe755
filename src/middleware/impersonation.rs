//! # Impersonation Stage
//!
//! Lets an authenticated caller act as another identity via the
//! `Impersonate-User`, `Impersonate-Group` and `Impersonate-Extra-<key>`
//! headers. Every requested attribute is authorized separately with the
//! `impersonate` verb:
//!
//! | header                     | resource          | group                   |
//! |----------------------------|-------------------|-------------------------|
//! | `Impersonate-User`         | `users`           | core                    |
//! | ... a service-account name | `serviceaccounts` | core, namespaced        |
//! | `Impersonate-Group`        | `groups`          | core                    |
//! | `Impersonate-Extra-<key>`  | `userextras/<key>`| `authentication.k8s.io` |
//!
//! The impersonated identity is layered on top of the authenticated one in the
//! request context; the audit record of who authenticated is left untouched.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, info};

use crate::audit::event::{impersonated_extra, IMPERSONATE_EXTRA_HEADER_PREFIX, IMPERSONATE_GROUP_HEADER, IMPERSONATE_USER_HEADER};
use crate::auth::authorizer::{Attributes, Authorizer};
use crate::auth::user::{split_service_account_name, UserInfo, ALL_AUTHENTICATED};
use crate::request::RequestContext;
use crate::responses;

const AUTHENTICATION_GROUP: &str = "authentication.k8s.io";

pub struct ImpersonationStage {
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl ImpersonationStage {
    /// Without an authorizer impersonation cannot be checked, so it is refused.
    pub fn new(authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        Self { authorizer }
    }
}

/// What a request asked to impersonate
#[derive(Debug, Default)]
struct ImpersonationRequest {
    user: Option<String>,
    groups: Vec<String>,
    extra: std::collections::BTreeMap<String, Vec<String>>,
}

impl ImpersonationRequest {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            user: headers
                .get(IMPERSONATE_USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            groups: headers
                .get_all(IMPERSONATE_GROUP_HEADER)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_string)
                .collect(),
            extra: impersonated_extra(headers),
        }
    }

    fn is_empty(&self) -> bool {
        self.user.is_none() && self.groups.is_empty() && self.extra.is_empty()
    }

    /// One authorization check per requested attribute
    fn checks(&self, requester: &UserInfo) -> Vec<Attributes> {
        let base = Attributes {
            user: Some(requester.clone()),
            verb: "impersonate".to_string(),
            is_resource_request: true,
            ..Default::default()
        };

        let mut checks = Vec::new();
        if let Some(user) = &self.user {
            let mut check = base.clone();
            match split_service_account_name(user) {
                Some((namespace, name)) => {
                    check.resource = "serviceaccounts".to_string();
                    check.namespace = namespace.to_string();
                    check.name = name.to_string();
                }
                None => {
                    check.resource = "users".to_string();
                    check.name = user.clone();
                }
            }
            checks.push(check);
        }
        for group in &self.groups {
            let mut check = base.clone();
            check.resource = "groups".to_string();
            check.name = group.clone();
            checks.push(check);
        }
        for (key, values) in &self.extra {
            for value in values {
                let mut check = base.clone();
                check.api_group = AUTHENTICATION_GROUP.to_string();
                check.resource = "userextras".to_string();
                check.subresource = key.clone();
                check.name = value.clone();
                checks.push(check);
            }
        }
        checks
    }

    fn into_user(self) -> Option<UserInfo> {
        let name = self.user?;
        let mut groups = self.groups;
        if groups.is_empty() {
            if let Some((namespace, _)) = split_service_account_name(&name) {
                groups.push("system:serviceaccounts".to_string());
                groups.push(format!("system:serviceaccounts:{}", namespace));
            }
        }
        if !groups.iter().any(|g| g == ALL_AUTHENTICATED) {
            groups.push(ALL_AUTHENTICATED.to_string());
        }
        Some(UserInfo {
            name,
            uid: String::new(),
            groups,
            extra: self.extra,
        })
    }
}

fn strip_impersonation_headers(headers: &mut HeaderMap) {
    let prefix = IMPERSONATE_EXTRA_HEADER_PREFIX.to_ascii_lowercase();
    let extra: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(prefix.as_str()))
        .cloned()
        .collect();
    for name in extra {
        headers.remove(name);
    }
    headers.remove(IMPERSONATE_USER_HEADER);
    headers.remove(IMPERSONATE_GROUP_HEADER);
}

pub async fn impersonation_stage(
    State(stage): State<Arc<ImpersonationStage>>,
    mut request: Request,
    next: Next,
) -> Response {
    let wanted = ImpersonationRequest::from_headers(request.headers());
    if wanted.is_empty() {
        return next.run(request).await;
    }

    let uri = request.uri().to_string();
    let Some(ctx) = RequestContext::from_request(&request) else {
        return responses::internal_error(&uri, &"no context found for request");
    };
    let Some(requester) = ctx.authenticated_user().cloned() else {
        return responses::internal_error(&uri, &"no user found for request");
    };
    if wanted.user.is_none() {
        return responses::internal_error(
            &uri,
            &"requested impersonation of groups or extra fields without a user",
        );
    }

    for check in wanted.checks(&requester) {
        let decision = match stage.authorizer.as_ref() {
            Some(authorizer) => authorizer.authorize(&check).await,
            None => Ok(crate::auth::authorizer::Decision::deny("impersonation requires an authorizer")),
        };
        match decision {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => {
                info!(
                    user = %requester.name,
                    resource = %check.resource,
                    name = %check.name,
                    "Forbidden impersonation attempt"
                );
                return responses::forbidden_error(&check, &decision.reason).into_response();
            }
            Err(e) => {
                error!(uri = %uri, error = %e, "Impersonation authorization failed");
                return responses::internal_error(&uri, &e);
            }
        }
    }

    let Some(user) = wanted.into_user() else {
        return responses::internal_error(&uri, &"no user to impersonate");
    };
    if ctx.set_impersonated_user(user).is_err() {
        return responses::internal_error(&uri, &"impersonated user already set for request");
    }
    strip_impersonation_headers(request.headers_mut());

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checks_cover_every_requested_attribute() {
        let mut headers = HeaderMap::new();
        headers.insert(IMPERSONATE_USER_HEADER, "system:serviceaccount:ci:deployer".parse().unwrap());
        headers.append(IMPERSONATE_GROUP_HEADER, "devs".parse().unwrap());
        headers.append("Impersonate-Extra-Scopes", "view".parse().unwrap());

        let wanted = ImpersonationRequest::from_headers(&headers);
        let checks = wanted.checks(&UserInfo::new("admin"));
        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0].resource, "serviceaccounts");
        assert_eq!(checks[0].namespace, "ci");
        assert_eq!(checks[0].name, "deployer");
        assert_eq!(checks[1].resource, "groups");
        assert_eq!(checks[2].resource, "userextras");
        assert_eq!(checks[2].subresource, "scopes");
        assert_eq!(checks[2].api_group, AUTHENTICATION_GROUP);
        assert!(checks.iter().all(|c| c.verb == "impersonate"));
    }

    #[test]
    fn impersonated_user_gets_default_groups() {
        let wanted = ImpersonationRequest {
            user: Some("system:serviceaccount:ci:deployer".to_string()),
            ..Default::default()
        };
        let user = wanted.into_user().unwrap();
        assert!(user.in_group("system:serviceaccounts"));
        assert!(user.in_group("system:serviceaccounts:ci"));
        assert!(user.in_group(ALL_AUTHENTICATED));
    }

    #[test]
    fn strips_all_impersonation_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(IMPERSONATE_USER_HEADER, "bob".parse().unwrap());
        headers.append(IMPERSONATE_GROUP_HEADER, "a".parse().unwrap());
        headers.append("Impersonate-Extra-Foo", "x".parse().unwrap());
        headers.insert("Accept", "application/json".parse().unwrap());
        strip_impersonation_headers(&mut headers);
        assert_eq!(headers.len(), 1);
    }
}
