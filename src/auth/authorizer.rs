//! Policy provider contract and the attributes it is asked about.

use async_trait::async_trait;

use crate::auth::user::UserInfo;
use crate::core::error::{ApiServerError, ApiServerResult};
use crate::request::{RequestContext, RequestInfo};

/// Everything a policy provider may consider about a request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub user: Option<UserInfo>,
    pub verb: String,
    pub is_resource_request: bool,
    pub path: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub namespace: String,
    pub name: String,
}

impl Attributes {
    pub fn from_request_info(user: Option<UserInfo>, info: &RequestInfo) -> Self {
        Self {
            user,
            verb: info.verb.clone(),
            is_resource_request: info.is_resource_request,
            path: info.path.clone(),
            api_group: info.api_group.clone(),
            api_version: info.api_version.clone(),
            resource: info.resource.clone(),
            subresource: info.subresource.clone(),
            namespace: info.namespace.clone(),
            name: info.name.clone(),
        }
    }

    /// Attributes for the effective identity of a request.
    ///
    /// Fails when the request info has not been resolved yet, which only happens
    /// when the handler chain was assembled in the wrong order.
    pub fn from_context(ctx: &RequestContext) -> ApiServerResult<Self> {
        let info = ctx
            .request_info()
            .ok_or_else(|| ApiServerError::internal("no RequestInfo found in the context"))?;
        Ok(Self::from_request_info(ctx.user().cloned(), info))
    }

    pub fn username(&self) -> &str {
        self.user.as_ref().map(|u| u.name.as_str()).unwrap_or("")
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny<S: Into<String>>(reason: S) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Policy provider. An `Err` is a provider failure, not a denial.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, attributes: &Attributes) -> ApiServerResult<Decision>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllowAuthorizer;

#[async_trait]
impl Authorizer for AlwaysAllowAuthorizer {
    async fn authorize(&self, _attributes: &Attributes) -> ApiServerResult<Decision> {
        Ok(Decision::allow())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDenyAuthorizer;

#[async_trait]
impl Authorizer for AlwaysDenyAuthorizer {
    async fn authorize(&self, _attributes: &Attributes) -> ApiServerResult<Decision> {
        Ok(Decision::deny("Everything is forbidden."))
    }
}
