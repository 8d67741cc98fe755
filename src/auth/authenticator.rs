//! Identity provider contract and a static bearer-token implementation.

use async_trait::async_trait;
use axum::http::{header, request::Parts};
use std::collections::HashMap;

use crate::auth::user::{UserInfo, ALL_AUTHENTICATED};
use crate::core::config::StaticTokenEntry;
use crate::core::error::ApiServerResult;

/// Identity provider.
///
/// `Ok(None)` means the request carried no credentials this provider recognises;
/// `Err` means the provider itself failed. Both end in a 401.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &Parts) -> ApiServerResult<Option<UserInfo>>;
}

/// Authenticates `Authorization: Bearer <token>` against a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserInfo>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[StaticTokenEntry]) -> Self {
        let mut authenticator = Self::new();
        for entry in entries {
            let user = UserInfo::new(entry.user.clone())
                .with_uid(entry.uid.clone())
                .with_groups(entry.groups.iter().cloned());
            authenticator.insert(entry.token.clone(), user);
        }
        authenticator
    }

    pub fn insert<S: Into<String>>(&mut self, token: S, user: UserInfo) {
        self.tokens.insert(token.into(), user);
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, request: &Parts) -> ApiServerResult<Option<UserInfo>> {
        let token = request
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty());

        let Some(token) = token else {
            return Ok(None);
        };

        Ok(self.tokens.get(token).map(|user| {
            let mut user = user.clone();
            if !user.in_group(ALL_AUTHENTICATED) {
                user.groups.push(ALL_AUTHENTICATED.to_string());
            }
            user
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/pods");
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn known_token_yields_user() {
        let mut authn = StaticTokenAuthenticator::new();
        authn.insert("secret", UserInfo::new("kubelet").with_groups(["system:nodes"]));

        let user = authn.authenticate(&parts(Some("Bearer secret"))).await.unwrap().unwrap();
        assert_eq!(user.name, "kubelet");
        assert!(user.in_group("system:nodes"));
        assert!(user.in_group(ALL_AUTHENTICATED));
    }

    #[tokio::test]
    async fn unknown_or_missing_token_yields_none() {
        let mut authn = StaticTokenAuthenticator::new();
        authn.insert("secret", UserInfo::new("kubelet"));

        assert!(authn.authenticate(&parts(Some("Bearer nope"))).await.unwrap().is_none());
        assert!(authn.authenticate(&parts(Some("Basic abc"))).await.unwrap().is_none());
        assert!(authn.authenticate(&parts(None)).await.unwrap().is_none());
    }
}
