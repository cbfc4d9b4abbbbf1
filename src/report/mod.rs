//! Report Module
//!
//! Per-replica outcomes and the aggregate judgment over them.

mod summary;
mod table;

pub use summary::{aggregate, AggregateReport, Disposition, DurationStats};
pub use table::{render_outcomes, render_summary};

use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, FailureKind};
use crate::replication::ReplicaTarget;

/// Result of replicating the operation to one target
///
/// Built through [`ReplicationOutcome::succeeded`] or
/// [`ReplicationOutcome::failed`], so a failed outcome never carries an
/// affected count and a successful one never carries an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationOutcome {
    target: ReplicaTarget,
    success: bool,
    operation: String,
    collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    affected_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ReplicationOutcome {
    pub fn succeeded(
        target: ReplicaTarget,
        operation: &str,
        collection: &str,
        affected_count: u64,
        duration: Duration,
    ) -> Self {
        Self {
            target,
            success: true,
            operation: operation.to_string(),
            collection: collection.to_string(),
            affected_count: Some(affected_count),
            duration_ms: Some(millis(duration)),
            failure: None,
            error: None,
        }
    }

    pub fn failed(
        target: ReplicaTarget,
        operation: &str,
        collection: &str,
        error: &Error,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            target,
            success: false,
            operation: operation.to_string(),
            collection: collection.to_string(),
            affected_count: None,
            duration_ms: duration.map(millis),
            failure: Some(error.kind()),
            error: Some(error.to_string()),
        }
    }

    pub fn target(&self) -> &ReplicaTarget {
        &self.target
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn affected_count(&self) -> Option<u64> {
        self.affected_count
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
