//! Replication Module
//!
//! Fans one sanitized operation out to a list of replicas and collects a
//! per-replica outcome for each of them.

mod connector;
pub mod dispatch;
mod registry;
mod scheduler;

pub use connector::{Attempt, ReplicaConnector};
pub use dispatch::{execute, DispatchResult};
pub use registry::{EndpointRegistry, ReplicaTarget};
pub use scheduler::Scheduler;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::operation::{OperationDescriptor, Sanitizer};
use crate::report::{aggregate, AggregateReport, ReplicationOutcome};
use crate::store::Connector;

/// Everything produced by one replication job
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub operation: String,
    pub collection: String,
    /// One entry per requested target, in request order
    pub outcomes: Vec<ReplicationOutcome>,
    pub report: AggregateReport,
}

impl ReplicationRun {
    fn new(
        operation: &str,
        collection: &str,
        started_at: DateTime<Utc>,
        outcomes: Vec<ReplicationOutcome>,
        wall_clock: Duration,
    ) -> Self {
        let report = aggregate(&outcomes, wall_clock);
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            operation: operation.to_string(),
            collection: collection.to_string(),
            outcomes,
            report,
        }
    }
}

/// The replication engine
pub struct Replicator {
    connector: ReplicaConnector,
    sanitizer: Sanitizer,
    scheduler: Scheduler,
}

impl Replicator {
    /// Build an engine from configuration and a store connector
    pub fn new(config: &MirrorConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = EndpointRegistry::from_map(&config.replicas);
        Self {
            connector: ReplicaConnector::new(Arc::new(registry), connector, config.connect_timeout()),
            sanitizer: Sanitizer::new(config.sanitize.fields.iter().cloned()),
            scheduler: Scheduler::new(config.replication.max_concurrent),
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        self.connector.registry()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler
    }

    /// Batches `targets` would be processed in, without connecting
    pub fn plan(&self, targets: &[ReplicaTarget]) -> Vec<Vec<ReplicaTarget>> {
        self.scheduler
            .plan(targets.len())
            .into_iter()
            .map(|range| targets[range].to_vec())
            .collect()
    }

    /// Replicate `operation` to every target
    ///
    /// Fails as a whole only when the descriptor itself is invalid; every
    /// replica-level failure is recorded on that replica's outcome.
    pub async fn replicate(
        &self,
        operation: &OperationDescriptor,
        targets: &[ReplicaTarget],
    ) -> Result<ReplicationRun> {
        operation.validate()?;

        let started_at = Utc::now();
        let clock = Instant::now();

        let sanitized = Arc::new(self.sanitizer.sanitize(operation));
        tracing::debug!(
            "Sanitized operation: {}",
            serde_json::to_string(sanitized.as_ref()).unwrap_or_default()
        );
        tracing::info!(
            "Replicating {} on '{}' to {} replica(s)",
            sanitized.kind,
            sanitized.collection,
            targets.len()
        );

        let outcomes = self
            .scheduler
            .fan_out(targets, |target: ReplicaTarget| {
                let operation = Arc::clone(&sanitized);
                async move { self.replicate_one(target, operation).await }
            })
            .await;

        let run = ReplicationRun::new(
            sanitized.kind.label(),
            &sanitized.collection,
            started_at,
            outcomes,
            clock.elapsed(),
        );

        tracing::info!(
            "Replication finished: {}/{} succeeded in {}ms",
            run.report.succeeded,
            run.report.total,
            run.report.wall_clock_ms
        );
        if run.report.critical_failure {
            tracing::error!(
                "Critical failure: {} of {} replicas failed",
                run.report.failed,
                run.report.total
            );
        }

        Ok(run)
    }

    /// Record the same failure for every target without touching any replica
    ///
    /// Used when the job can be described but not executed, such as an
    /// unrecognized operation name.
    pub fn reject(
        &self,
        operation: &str,
        collection: &str,
        targets: &[ReplicaTarget],
        error: &Error,
    ) -> ReplicationRun {
        tracing::warn!("Rejecting operation '{}' for {} replica(s): {}", operation, targets.len(), error);

        let outcomes = targets
            .iter()
            .map(|target| ReplicationOutcome::failed(target.clone(), operation, collection, error, None))
            .collect();

        ReplicationRun::new(operation, collection, Utc::now(), outcomes, Duration::ZERO)
    }

    async fn replicate_one(
        &self,
        target: ReplicaTarget,
        operation: Arc<OperationDescriptor>,
    ) -> ReplicationOutcome {
        let body_operation = Arc::clone(&operation);
        let attempt = self
            .connector
            .with_connection(&target, move |store| async move {
                execute(store.as_ref(), &body_operation).await
            })
            .await;

        let label = operation.kind.label();
        match attempt.result {
            Ok(result) => {
                let elapsed = attempt.elapsed.unwrap_or_default();
                tracing::info!(
                    target_id = %target,
                    "{} on {}: {} document(s) in {:?}",
                    label,
                    target,
                    result.affected_count,
                    elapsed
                );
                ReplicationOutcome::succeeded(
                    target,
                    label,
                    &operation.collection,
                    result.affected_count,
                    elapsed,
                )
            }
            Err(e) => {
                tracing::warn!(target_id = %target, "{} on {} failed: {}", label, target, e);
                ReplicationOutcome::failed(target, label, &operation.collection, &e, attempt.elapsed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::operation::{Document, OperationKind};
    use crate::report::Disposition;
    use crate::store::MemoryCluster;
    use serde_json::json;

    fn config(replicas: usize, max_concurrent: usize) -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.replication.max_concurrent = max_concurrent;
        config.replication.connect_timeout_ms = 1000;
        for i in 1..=replicas {
            config
                .replicas
                .insert(format!("ins{}", i), format!("memory://ins{}", i));
        }
        config
    }

    fn targets(n: usize) -> Vec<ReplicaTarget> {
        (1..=n).map(|i| ReplicaTarget::new(format!("ins{}", i))).collect()
    }

    fn insert_one() -> OperationDescriptor {
        OperationDescriptor::new(OperationKind::InsertOne, "students")
            .with_data(json!({"Id_Aula": 7, "name": "Ana"}))
    }

    fn engine(replicas: usize, max_concurrent: usize) -> (Arc<MemoryCluster>, Replicator) {
        let cluster = Arc::new(MemoryCluster::new());
        let replicator = Replicator::new(&config(replicas, max_concurrent), cluster.clone());
        (cluster, replicator)
    }

    #[tokio::test]
    async fn test_insert_to_all_replicas() {
        let (cluster, replicator) = engine(5, 5);

        let run = replicator.replicate(&insert_one(), &targets(5)).await.unwrap();

        assert_eq!(run.outcomes.len(), 5);
        assert!(run.outcomes.iter().all(|o| o.is_success()));
        assert!(run.outcomes.iter().all(|o| o.affected_count() == Some(1)));
        assert_eq!(run.report.total_affected, 5);
        assert_eq!(run.report.disposition(), Disposition::Success);
        assert_eq!(run.operation, "insertOne");

        // Sanitized before dispatch
        for i in 1..=5 {
            let docs = cluster.replica(&format!("ins{}", i)).documents("students");
            assert_eq!(docs.len(), 1);
            assert_eq!(docs[0].get("Id_Aula"), Some(&json!("7")));
        }
    }

    #[tokio::test]
    async fn test_outcomes_keep_request_order() {
        let (_, replicator) = engine(7, 5);
        let requested = targets(7);

        let run = replicator.replicate(&insert_one(), &requested).await.unwrap();

        let order: Vec<&ReplicaTarget> = run.outcomes.iter().map(|o| o.target()).collect();
        assert_eq!(order, requested.iter().collect::<Vec<_>>());
        assert_eq!(replicator.plan(&requested).len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (cluster, replicator) = engine(4, 5);
        for name in ["ins1", "ins2", "ins3"] {
            cluster.replica(name).set_operation_error("not primary");
        }

        let run = replicator.replicate(&insert_one(), &targets(4)).await.unwrap();

        assert_eq!(run.report.failed, 3);
        assert!(run.report.critical_failure);
        assert_eq!(run.report.exit_code(), 1);
        assert!(run.outcomes[3].is_success());
        assert_eq!(run.outcomes[0].error(), Some("not primary"));
        assert_eq!(run.outcomes[0].failure(), Some(FailureKind::Operation));
    }

    #[tokio::test]
    async fn test_half_failed_is_partial() {
        let (cluster, replicator) = engine(4, 5);
        cluster.replica("ins1").set_connect_error("connection refused");
        cluster.replica("ins2").set_operation_error("not primary");

        let run = replicator.replicate(&insert_one(), &targets(4)).await.unwrap();

        assert!(!run.report.critical_failure);
        assert_eq!(run.report.disposition(), Disposition::Partial);
        assert_eq!(run.outcomes[0].failure(), Some(FailureKind::Connection));
        assert_eq!(run.outcomes[0].duration_ms(), None);
    }

    #[tokio::test]
    async fn test_unknown_target_is_configuration_failure() {
        let (cluster, replicator) = engine(2, 5);
        let mut requested = targets(2);
        requested.push(ReplicaTarget::from("ins9"));

        let run = replicator.replicate(&insert_one(), &requested).await.unwrap();

        assert_eq!(run.outcomes.len(), 3);
        assert_eq!(run.outcomes[2].failure(), Some(FailureKind::Configuration));
        assert!(!cluster.names().contains(&"ins9".to_string()));
    }

    #[tokio::test]
    async fn test_blank_endpoint_fails_only_that_target() {
        let toml = "[replicas]\nins1 = \"memory://ins1\"\nins2 = \"\"\n";
        let config = MirrorConfig::from_str(toml).unwrap();
        let cluster = Arc::new(MemoryCluster::new());
        let replicator = Replicator::new(&config, cluster.clone());

        let run = replicator.replicate(&insert_one(), &targets(2)).await.unwrap();

        assert!(run.outcomes[0].is_success());
        assert_eq!(run.outcomes[1].failure(), Some(FailureKind::Configuration));
        assert_eq!(run.outcomes[1].duration_ms(), None);
        assert!(!run.report.critical_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_connections_respect_limit() {
        let (cluster, replicator) = engine(12, 5);
        for i in 1..=12 {
            cluster
                .replica(&format!("ins{}", i))
                .set_operation_delay(Duration::from_millis(20));
        }

        let run = replicator.replicate(&insert_one(), &targets(12)).await.unwrap();
        assert_eq!(run.report.succeeded, 12);
        assert_eq!(cluster.peak_open(), 5);

        for i in 1..=12 {
            let stats = cluster.replica(&format!("ins{}", i)).stats();
            assert_eq!(stats.connects, 1);
            assert_eq!(stats.closes, 1);
            assert_eq!(stats.open, 0);
        }
    }

    #[tokio::test]
    async fn test_invalid_descriptor_touches_nothing() {
        let (cluster, replicator) = engine(3, 5);
        let op = OperationDescriptor::new(OperationKind::InsertOne, "students");

        let err = replicator.replicate(&op, &targets(3)).await.unwrap_err();

        assert!(err.is_fatal());
        assert!(cluster.names().is_empty());
    }

    #[tokio::test]
    async fn test_update_filter_is_sanitized() {
        let (cluster, replicator) = engine(1, 5);
        cluster.replica("ins1").seed(
            "students",
            vec![json!({"_id": 1, "Id_Aula": "7"}).as_object().cloned().unwrap()],
        );

        let mut filter = Document::new();
        filter.insert("Id_Aula".into(), json!(7));
        let op = OperationDescriptor::new(OperationKind::UpdateOne, "students")
            .with_filter(filter)
            .with_data(json!({"$set": {"active": true}}));

        let run = replicator.replicate(&op, &targets(1)).await.unwrap();
        assert_eq!(run.outcomes[0].affected_count(), Some(1));
    }

    #[test]
    fn test_reject_records_every_target() {
        let (cluster, replicator) = engine(3, 5);
        let error = Error::UnsupportedOperation {
            operation: "bulkWrite".into(),
            collection: "students".into(),
        };

        let run = replicator.reject("bulkWrite", "students", &targets(3), &error);

        assert_eq!(run.outcomes.len(), 3);
        assert!(run
            .outcomes
            .iter()
            .all(|o| o.failure() == Some(FailureKind::UnsupportedOperation)));
        assert!(run.report.critical_failure);
        assert!(cluster.names().is_empty());
    }
}
