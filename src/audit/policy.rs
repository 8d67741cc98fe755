//! Audit policy: which level a request is recorded at.

use serde::{Deserialize, Serialize};

use crate::audit::event::Level;
use crate::auth::authorizer::Attributes;

/// Decides the audit level of a request from its authorizer attributes
pub trait AuditPolicy: Send + Sync {
    fn level(&self, attributes: &Attributes) -> Level;
}

/// Audits every request at the same level
#[derive(Debug, Clone, Copy)]
pub struct FixedLevelPolicy(pub Level);

impl AuditPolicy for FixedLevelPolicy {
    fn level(&self, _attributes: &Attributes) -> Level {
        self.0
    }
}

/// A single policy rule; empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub level: Level,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub user_groups: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Resource names, optionally qualified as `resource.group`
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Non-resource paths; a trailing `*` matches any suffix
    #[serde(default)]
    pub non_resource_urls: Vec<String>,
}

impl PolicyRule {
    fn matches(&self, attributes: &Attributes) -> bool {
        let user = attributes.user.as_ref();

        if !self.users.is_empty() && !user.is_some_and(|u| self.users.contains(&u.name)) {
            return false;
        }
        if !self.user_groups.is_empty()
            && !user.is_some_and(|u| u.groups.iter().any(|g| self.user_groups.contains(g)))
        {
            return false;
        }
        if !self.verbs.is_empty() && !self.verbs.contains(&attributes.verb) {
            return false;
        }

        if attributes.is_resource_request {
            if !self.non_resource_urls.is_empty() && self.resources.is_empty() {
                return false;
            }
            if !self.resources.is_empty() {
                let qualified = format!("{}.{}", attributes.resource, attributes.api_group);
                let hit = self.resources.iter().any(|r| {
                    r == &attributes.resource || (!attributes.api_group.is_empty() && r == &qualified)
                });
                if !hit {
                    return false;
                }
            }
            if !self.namespaces.is_empty() && !self.namespaces.contains(&attributes.namespace) {
                return false;
            }
        } else {
            if !self.resources.is_empty() || !self.namespaces.is_empty() {
                return false;
            }
            if !self.non_resource_urls.is_empty() {
                let hit = self.non_resource_urls.iter().any(|pattern| match pattern.strip_suffix('*') {
                    Some(prefix) => attributes.path.starts_with(prefix),
                    None => pattern == &attributes.path,
                });
                if !hit {
                    return false;
                }
            }
        }
        true
    }
}

/// Ordered rules; the first match decides. Requests matching nothing get `default_level`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePolicy {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub default_level: Level,
}

impl AuditPolicy for RulePolicy {
    fn level(&self, attributes: &Attributes) -> Level {
        self.rules
            .iter()
            .find(|rule| rule.matches(attributes))
            .map(|rule| rule.level)
            .unwrap_or(self.default_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::user::UserInfo;

    fn attrs(user: &str, verb: &str, resource: &str, path: &str) -> Attributes {
        Attributes {
            user: Some(UserInfo::new(user).with_groups(["system:authenticated"])),
            verb: verb.to_string(),
            is_resource_request: !resource.is_empty(),
            path: path.to_string(),
            resource: resource.to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = RulePolicy {
            rules: vec![
                PolicyRule {
                    level: Level::None,
                    users: vec!["system:kube-proxy".to_string()],
                    verbs: vec!["watch".to_string()],
                    ..Default::default()
                },
                PolicyRule {
                    level: Level::None,
                    non_resource_urls: vec!["/healthz*".to_string()],
                    ..Default::default()
                },
                PolicyRule {
                    level: Level::RequestResponse,
                    resources: vec!["secrets".to_string()],
                    ..Default::default()
                },
            ],
            default_level: Level::Metadata,
        };

        assert_eq!(policy.level(&attrs("system:kube-proxy", "watch", "endpoints", "")), Level::None);
        assert_eq!(policy.level(&attrs("alice", "get", "", "/healthz/ping")), Level::None);
        assert_eq!(policy.level(&attrs("alice", "get", "secrets", "")), Level::RequestResponse);
        assert_eq!(policy.level(&attrs("alice", "get", "pods", "")), Level::Metadata);
    }

    #[test]
    fn rules_deserialize_from_yaml() {
        let yaml = r#"
defaultLevel: Request
rules:
  - level: None
    userGroups: ["system:nodes"]
"#;
        let policy: RulePolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.default_level, Level::Request);
        assert_eq!(policy.rules[0].user_groups, vec!["system:nodes"]);
    }
}
