//! Replica Registry
//!
//! Resolves opaque replica identifiers to connection endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::Endpoint;

/// Opaque identifier of one replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaTarget(String);

impl ReplicaTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a JSON array of target identifiers
    pub fn list_from_json(json: &str) -> crate::Result<Vec<Self>> {
        let targets: Vec<Self> = serde_json::from_str(json)?;
        Ok(targets)
    }
}

impl From<&str> for ReplicaTarget {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReplicaTarget {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ReplicaTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target id -> endpoint URL mapping
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<ReplicaTarget, String>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[replicas]` table of the configuration
    pub fn from_map(replicas: &BTreeMap<String, String>) -> Self {
        Self {
            endpoints: replicas
                .iter()
                .map(|(id, url)| (ReplicaTarget::new(id.clone()), url.clone()))
                .collect(),
        }
    }

    pub fn insert(&mut self, target: ReplicaTarget, url: impl Into<String>) {
        self.endpoints.insert(target, url.into());
    }

    /// Endpoint for `target`, or `None` when it is not configured
    pub fn resolve(&self, target: &ReplicaTarget) -> Option<Endpoint> {
        self.endpoints
            .get(target)
            .filter(|url| !url.trim().is_empty())
            .map(|url| Endpoint::new(target.clone(), url.clone()))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
