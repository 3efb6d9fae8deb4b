//! Ranks completed runs by one metric

use crate::error::EvalError;
use crate::metrics::{AVG_LATENCY, AVG_TOKENS};
use crate::store::RunStore;
use crate::types::{DatasetId, InferenceRun, ModelId, ProviderId, RunFilter, RunId, RunStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Which end of a metric is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Larger values rank first
    HigherIsBetter,
    /// Smaller values rank first
    LowerIsBetter,
}

impl Direction {
    /// Direction of a named metric
    #[must_use]
    pub fn of(metric: &str) -> Self {
        match metric {
            AVG_LATENCY | AVG_TOKENS => Self::LowerIsBetter,
            _ => Self::HigherIsBetter,
        }
    }

    fn compare(self, a: f64, b: f64) -> Ordering {
        match self {
            Self::HigherIsBetter => b.total_cmp(&a),
            Self::LowerIsBetter => a.total_cmp(&b),
        }
    }
}

/// One ranked run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based position
    pub rank: usize,
    /// Ranked run
    pub run_id: RunId,
    /// Run name
    pub name: String,
    /// Dataset evaluated
    pub dataset_id: DatasetId,
    /// Provider used
    pub provider_id: ProviderId,
    /// Model evaluated
    pub model_id: ModelId,
    /// Metric value
    pub value: f64,
}

/// Leaderboard over a run store
#[derive(Clone)]
pub struct Leaderboard {
    store: Arc<dyn RunStore>,
}

impl Leaderboard {
    /// Create leaderboard over a store
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Completed runs matching `filter` that carry `metric`, best first
    ///
    /// The filter's status is ignored; only completed runs rank. Ties keep
    /// newest-first order.
    pub async fn rank(
        &self,
        metric: &str,
        filter: &RunFilter,
    ) -> Result<Vec<LeaderboardEntry>, EvalError> {
        let filter = filter.clone().with_status(RunStatus::Completed);
        let runs = self.store.list_runs(&filter).await?;
        Ok(rank_runs(metric, runs))
    }
}

impl std::fmt::Debug for Leaderboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaderboard").finish_non_exhaustive()
    }
}

/// Rank already-loaded runs by `metric`
#[must_use]
pub fn rank_runs(metric: &str, runs: Vec<InferenceRun>) -> Vec<LeaderboardEntry> {
    let direction = Direction::of(metric);

    let mut scored: Vec<(f64, InferenceRun)> = runs
        .into_iter()
        .filter(|run| run.status == RunStatus::Completed)
        .filter_map(|run| {
            let value = run.metrics.as_ref()?.get(metric).copied()?;
            Some((value, run))
        })
        .collect();
    // Stable sort keeps the incoming order for equal values
    scored.sort_by(|(a, _), (b, _)| direction.compare(*a, *b));

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (value, run))| LeaderboardEntry {
            rank: i + 1,
            run_id: run.id,
            name: run.name,
            dataset_id: run.dataset_id,
            provider_id: run.provider_id,
            model_id: run.model_id,
            value,
        })
        .collect()
}
