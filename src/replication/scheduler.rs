//! Concurrency Scheduler
//!
//! Fans work out over a list of targets with a ceiling on simultaneous work.
//! Up to `limit` targets run together; longer lists are cut into contiguous
//! batches that run one after another.

use std::fmt::Display;
use std::future::Future;
use std::ops::Range;

use futures::future::join_all;

/// Bounded fan-out over a target list
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    limit: usize,
}

impl Scheduler {
    /// Create a scheduler; a zero limit is treated as one
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Index ranges of the batches for `len` targets
    pub fn plan(&self, len: usize) -> Vec<Range<usize>> {
        (0..len)
            .step_by(self.limit)
            .map(|start| start..(start + self.limit).min(len))
            .collect()
    }

    /// Run `per_target` for every target and collect one output per target
    ///
    /// Members of a batch run concurrently; batch k+1 starts only after every
    /// member of batch k has settled. Outputs keep input order. Nothing is
    /// retried and no target is skipped because a sibling failed.
    pub async fn fan_out<T, O, F, Fut>(&self, targets: &[T], per_target: F) -> Vec<O>
    where
        T: Clone + Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = O>,
    {
        let batches = self.plan(targets.len());
        let mut outputs = Vec::with_capacity(targets.len());

        if batches.len() <= 1 {
            tracing::info!(
                "Replicating to all {} target(s) concurrently",
                targets.len()
            );
        } else {
            tracing::info!(
                "Processing {} targets in batches of {}",
                targets.len(),
                self.limit
            );
        }

        let total = batches.len();
        for (index, range) in batches.into_iter().enumerate() {
            let batch = &targets[range];

            if total > 1 {
                tracing::info!(
                    "Processing batch {}/{}: [{}]",
                    index + 1,
                    total,
                    batch.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
                );
            }

            let settled = join_all(batch.iter().cloned().map(&per_target)).await;
            outputs.extend(settled);
        }

        outputs
    }
}
