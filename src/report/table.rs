//! Console rendering of outcomes and summaries

use std::fmt::Write;

use super::{AggregateReport, Disposition, ReplicationOutcome};

/// Render one row per outcome in a fixed-width table
pub fn render_outcomes(outcomes: &[ReplicationOutcome]) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{:<16} {:<8} {:<16} {:<10} {:<12} {}",
        "TARGET", "STATUS", "OPERATION", "AFFECTED", "DURATION", "ERROR"
    );
    let _ = writeln!(out, "{}", "-".repeat(80));

    for outcome in outcomes {
        let status = if outcome.is_success() { "OK" } else { "FAILED" };
        let affected = outcome
            .affected_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        let duration = outcome
            .duration_ms()
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let error = match (outcome.failure(), outcome.error()) {
            (Some(kind), Some(message)) => format!("[{}] {}", kind, message),
            _ => String::new(),
        };

        let _ = writeln!(
            out,
            "{:<16} {:<8} {:<16} {:<10} {:<12} {}",
            outcome.target(),
            status,
            outcome.operation(),
            affected,
            duration,
            error
        );
    }

    out
}

/// Render the aggregate summary block
pub fn render_summary(report: &AggregateReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Replication Summary");
    let _ = writeln!(out, "===================");
    let _ = writeln!(
        out,
        "Targets: {}  |  Succeeded: {}  |  Failed: {}",
        report.total, report.succeeded, report.failed
    );
    let _ = writeln!(out, "Affected documents: {}", report.total_affected);
    let _ = writeln!(out, "Wall clock: {}ms", report.wall_clock_ms);

    if let Some(durations) = report.durations {
        let _ = writeln!(
            out,
            "Per-replica: total {}ms, avg {:.1}ms, min {}ms, max {}ms",
            durations.total_ms, durations.average_ms, durations.min_ms, durations.max_ms
        );
    }
    if let Some(gain) = report.parallel_gain_percent() {
        let _ = writeln!(out, "Parallel gain: {}%", gain);
    }

    let verdict = match report.disposition() {
        Disposition::Success => "SUCCESS: all replicas updated",
        Disposition::Partial => "PARTIAL: some replicas failed",
        Disposition::Critical => "CRITICAL: more than half of the replicas failed",
    };
    let _ = writeln!(out, "{}", verdict);

    out
}
