//! # API Version Priorities
//!
//! Fixed `(group, version) -> (group priority, version priority)` table used
//! when auto-registering the server's own group versions. A group version that
//! is missing from the table is skipped, never registered with a made-up priority.

use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::info;

use crate::controllers::apiregistration::{ApiService, GroupVersion};
use crate::controllers::autoregister::AutoApiServiceRegistration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub group: i32,
    pub version: i32,
}

const DEFAULT_PRIORITIES: &[(&str, &str, i32, i32)] = &[
    ("", "v1", 18000, 1),
    ("extensions", "v1beta1", 17900, 1),
    ("apps", "v1beta1", 17800, 1),
    ("apps", "v1beta2", 17800, 1),
    ("authentication.k8s.io", "v1", 17700, 15),
    ("authentication.k8s.io", "v1beta1", 17700, 9),
    ("authorization.k8s.io", "v1", 17600, 15),
    ("authorization.k8s.io", "v1beta1", 17600, 9),
    ("autoscaling", "v1", 17500, 15),
    ("autoscaling", "v2alpha1", 17500, 9),
    ("batch", "v1", 17400, 15),
    ("batch", "v1beta1", 17400, 9),
    ("batch", "v2alpha1", 17400, 9),
    ("certificates.k8s.io", "v1beta1", 17300, 9),
    ("networking.k8s.io", "v1", 17200, 15),
    ("policy", "v1beta1", 17100, 9),
    ("rbac.authorization.k8s.io", "v1", 17000, 15),
    ("rbac.authorization.k8s.io", "v1beta1", 17000, 12),
    ("rbac.authorization.k8s.io", "v1alpha1", 17000, 9),
    ("settings.k8s.io", "v1alpha1", 16900, 9),
    ("storage.k8s.io", "v1", 16800, 15),
    ("storage.k8s.io", "v1beta1", 16800, 9),
    ("apiextensions.k8s.io", "v1beta1", 16700, 9),
    ("admissionregistration.k8s.io", "v1alpha1", 16700, 9),
];

/// Immutable once built
#[derive(Debug, Clone)]
pub struct ApiVersionPriorities {
    table: HashMap<GroupVersion, Priority>,
}

impl Default for ApiVersionPriorities {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITIES.iter().map(|&(group, version, g, v)| {
            (GroupVersion::new(group, version), Priority { group: g, version: v })
        }))
    }
}

impl ApiVersionPriorities {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (GroupVersion, Priority)>,
    {
        Self {
            table: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, gv: &GroupVersion) -> Option<Priority> {
        self.table.get(gv).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The locally served APIService for `gv`, or `None` to skip it
    pub fn make_api_service(&self, gv: &GroupVersion) -> Option<ApiService> {
        let Some(priority) = self.get(gv) else {
            info!(group_version = %gv, "Skipping APIService creation for {}", gv);
            return None;
        };
        Some(ApiService::local(gv, priority.group, priority.version))
    }
}

/// Desired APIServices for the server's listed paths.
///
/// `/api/v1` maps to the legacy group and `/apis/<group>/<version>` to that
/// group version; other paths are ignored. Each service is also handed to
/// `registration`.
pub fn api_services_to_register(
    listed_paths: &[String],
    registration: &dyn AutoApiServiceRegistration,
    priorities: &ApiVersionPriorities,
) -> Vec<ApiService> {
    let mut services = Vec::new();

    for path in listed_paths {
        let gv = if path == "/api/v1" {
            GroupVersion::new("", "v1")
        } else {
            if !path.starts_with("/apis/") {
                continue;
            }
            let tokens: Vec<&str> = path.split('/').collect();
            if tokens.len() != 4 {
                continue;
            }
            GroupVersion::new(tokens[2], tokens[3])
        };

        let Some(service) = priorities.make_api_service(&gv) else {
            continue;
        };
        registration.add_api_service_to_sync(service.clone());
        services.push(service);
    }

    services
}

/// Highest group priority first, then highest version priority, then name
pub fn sort_by_priority(services: &mut [ApiService]) {
    services.sort_by(compare_priority);
}

fn compare_priority(a: &ApiService, b: &ApiService) -> Ordering {
    b.spec
        .group_priority_minimum
        .cmp(&a.spec.group_priority_minimum)
        .then_with(|| b.spec.version_priority.cmp(&a.spec.version_priority))
        .then_with(|| a.name().cmp(b.name()))
}
