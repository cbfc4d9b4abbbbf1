//! Aggregate Report
//!
//! A pure fold over the outcome list.

use std::time::Duration;

use serde::Serialize;

use super::{millis, ReplicationOutcome};

/// Overall classification of a replication run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Every target succeeded
    Success,
    /// Some targets failed, but not more than half
    Partial,
    /// More than half of the targets failed
    Critical,
}

/// Per-replica duration statistics over successful outcomes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DurationStats {
    pub total_ms: u64,
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Summary of a replication run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Affected documents summed over successful targets
    pub total_affected: u64,
    pub wall_clock_ms: u64,
    /// Absent when no target succeeded
    pub durations: Option<DurationStats>,
    /// Strictly more than half of the targets failed
    pub critical_failure: bool,
}

impl AggregateReport {
    pub fn disposition(&self) -> Disposition {
        if self.critical_failure {
            Disposition::Critical
        } else if self.failed > 0 {
            Disposition::Partial
        } else {
            Disposition::Success
        }
    }

    /// Process exit code: non-zero only for a critical failure
    pub fn exit_code(&self) -> i32 {
        if self.critical_failure {
            1
        } else {
            0
        }
    }

    /// Estimated gain of the concurrent run over running targets one by one
    ///
    /// Compares the summed per-target durations with the wall clock, as a
    /// rounded percentage. `None` when there is nothing to compare.
    pub fn parallel_gain_percent(&self) -> Option<i64> {
        let serial = self.durations?.total_ms;
        if serial == 0 {
            return None;
        }
        let gain = (serial as f64 - self.wall_clock_ms as f64) / serial as f64 * 100.0;
        Some(gain.round() as i64)
    }
}

/// Fold `outcomes` into an [`AggregateReport`]
pub fn aggregate(outcomes: &[ReplicationOutcome], wall_clock: Duration) -> AggregateReport {
    let total = outcomes.len();
    let successes: Vec<&ReplicationOutcome> = outcomes.iter().filter(|o| o.is_success()).collect();
    let succeeded = successes.len();
    let failed = total - succeeded;

    let total_affected = successes
        .iter()
        .filter_map(|o| o.affected_count())
        .sum();

    let durations: Vec<u64> = successes
        .iter()
        .map(|o| o.duration_ms().unwrap_or(0))
        .collect();

    let durations = match (durations.iter().min(), durations.iter().max()) {
        (Some(&min_ms), Some(&max_ms)) => {
            let total_ms: u64 = durations.iter().sum();
            Some(DurationStats {
                total_ms,
                average_ms: total_ms as f64 / durations.len() as f64,
                min_ms,
                max_ms,
            })
        }
        _ => None,
    };

    AggregateReport {
        total,
        succeeded,
        failed,
        total_affected,
        wall_clock_ms: millis(wall_clock),
        durations,
        critical_failure: failed * 2 > total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::replication::ReplicaTarget;

    fn ok(id: &str, affected: u64, ms: u64) -> ReplicationOutcome {
        ReplicationOutcome::succeeded(
            ReplicaTarget::from(id),
            "insertOne",
            "students",
            affected,
            Duration::from_millis(ms),
        )
    }

    fn failed(id: &str) -> ReplicationOutcome {
        ReplicationOutcome::failed(
            ReplicaTarget::from(id),
            "insertOne",
            "students",
            &Error::operation("E11000 duplicate key error"),
            Some(Duration::from_millis(3)),
        )
    }

    #[test]
    fn test_all_succeeded() {
        let outcomes = vec![ok("a", 1, 10), ok("b", 2, 30), ok("c", 3, 20)];
        let report = aggregate(&outcomes, Duration::from_millis(35));

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total_affected, 6);
        let durations = report.durations.unwrap();
        assert_eq!(durations.total_ms, 60);
        assert_eq!(durations.average_ms, 20.0);
        assert_eq!(durations.min_ms, 10);
        assert_eq!(durations.max_ms, 30);
        assert!(!report.critical_failure);
        assert_eq!(report.disposition(), Disposition::Success);
        assert_eq!(report.exit_code(), 0);
        // (60 - 35) / 60
        assert_eq!(report.parallel_gain_percent(), Some(42));
    }

    #[test]
    fn test_three_of_four_failed_is_critical() {
        let outcomes = vec![failed("a"), failed("b"), failed("c"), ok("d", 1, 5)];
        let report = aggregate(&outcomes, Duration::from_millis(8));

        assert!(report.critical_failure);
        assert_eq!(report.disposition(), Disposition::Critical);
        assert_eq!(report.exit_code(), 1);
        // Failure durations do not count
        assert_eq!(report.durations.unwrap().total_ms, 5);
    }

    #[test]
    fn test_exactly_half_is_not_critical() {
        let outcomes = vec![failed("a"), failed("b"), ok("c", 1, 5), ok("d", 1, 5)];
        let report = aggregate(&outcomes, Duration::from_millis(8));

        assert!(!report.critical_failure);
        assert_eq!(report.disposition(), Disposition::Partial);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_threshold_for_small_counts() {
        for total in 0..=9usize {
            for failures in 0..=total {
                let outcomes: Vec<ReplicationOutcome> = (0..total)
                    .map(|i| if i < failures { failed("x") } else { ok("y", 1, 1) })
                    .collect();
                let report = aggregate(&outcomes, Duration::ZERO);
                let expected = failures as f64 > total as f64 / 2.0;
                assert_eq!(report.critical_failure, expected, "{}/{}", failures, total);
            }
        }
    }

    #[test]
    fn test_no_successes_has_no_duration_stats() {
        let report = aggregate(&[failed("a")], Duration::from_millis(1));
        assert!(report.durations.is_none());
        assert_eq!(report.total_affected, 0);
        assert_eq!(report.parallel_gain_percent(), None);
    }

    #[test]
    fn test_empty_run() {
        let report = aggregate(&[], Duration::ZERO);
        assert_eq!(report.total, 0);
        assert!(!report.critical_failure);
        assert_eq!(report.disposition(), Disposition::Success);
    }
}
