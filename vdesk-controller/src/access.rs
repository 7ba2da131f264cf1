//! Authorization gate for the REST API.
//!
//! Authentication happens upstream; the principal arrives in the
//! `X-Principal` header. The gate only answers whether that principal may
//! perform an action on a resource class.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use tracing::warn;

use crate::config::AccessConfig;

/// Resource classes guarded by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Storage,
    Compute,
}

/// Actions on a resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Manage,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Storage => "STORAGE",
            Resource::Compute => "COMPUTE",
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "CREATE",
            Action::Read => "READ",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::Manage => "MANAGE",
        })
    }
}

/// Answers `can_perform(principal, resource, action)`.
pub trait AccessGate: Send + Sync {
    fn can_perform(&self, principal: &str, resource: Resource, action: Action) -> bool;
}

/// Gate that allows every principal.
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn can_perform(&self, _principal: &str, _resource: Resource, _action: Action) -> bool {
        true
    }
}

/// One grant from the permission matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Grant {
    All,
    AnyAction(Resource),
    Exact(Resource, Action),
}

impl FromStr for Grant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s.trim() == "*" {
            return Ok(Grant::All);
        }
        let (resource, action) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("expected RESOURCE:ACTION, got '{}'", s))?;
        let resource = match resource.trim().to_uppercase().as_str() {
            "STORAGE" => Resource::Storage,
            "COMPUTE" => Resource::Compute,
            other => return Err(anyhow!("unknown resource '{}'", other)),
        };
        let action = match action.trim().to_uppercase().as_str() {
            "*" => return Ok(Grant::AnyAction(resource)),
            "CREATE" => Action::Create,
            "READ" => Action::Read,
            "UPDATE" => Action::Update,
            "DELETE" => Action::Delete,
            "MANAGE" => Action::Manage,
            other => return Err(anyhow!("unknown action '{}'", other)),
        };
        Ok(Grant::Exact(resource, action))
    }
}

/// Static principal → permission matrix loaded from configuration.
pub struct StaticPermissionMatrix {
    grants: BTreeMap<String, HashSet<Grant>>,
}

impl StaticPermissionMatrix {
    pub fn from_config(config: &AccessConfig) -> anyhow::Result<Self> {
        let mut grants = BTreeMap::new();
        for (principal, permissions) in &config.principals {
            let parsed = permissions
                .iter()
                .map(|p| p.parse::<Grant>().map_err(|e| anyhow!("principal {}: {}", principal, e)))
                .collect::<anyhow::Result<HashSet<_>>>()?;
            grants.insert(principal.clone(), parsed);
        }
        Ok(Self { grants })
    }
}

impl AccessGate for StaticPermissionMatrix {
    fn can_perform(&self, principal: &str, resource: Resource, action: Action) -> bool {
        let allowed = self.grants.get(principal).is_some_and(|grants| {
            grants.contains(&Grant::All)
                || grants.contains(&Grant::AnyAction(resource))
                || grants.contains(&Grant::Exact(resource, action))
        });
        if !allowed {
            warn!(principal = %principal, permission = %format!("{}:{}", resource, action), "Permission denied");
        }
        allowed
    }
}
