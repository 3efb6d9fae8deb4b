//! Post-run metrics aggregation
//!
//! Metrics are computed opportunistically from whichever result fields are
//! populated:
//! - `exact_match`: percent of results with an expected output whose trimmed
//!   actual output equals the trimmed expected output
//! - `avg_latency`: mean latency over results that recorded one
//! - `avg_tokens`: mean token count over results that recorded one
//!
//! A metric with no contributing results is absent from the map, never zero.

use crate::error::EvalError;
use crate::store::RunStore;
use crate::types::{InferenceResult, MetricsMap, RunId, RunStatus};
use std::sync::Arc;

/// Exact-match percentage key
pub const EXACT_MATCH: &str = "exact_match";
/// Mean latency key
pub const AVG_LATENCY: &str = "avg_latency";
/// Mean token count key
pub const AVG_TOKENS: &str = "avg_tokens";

/// Compute the run-level metrics map for a set of results
#[must_use]
pub fn aggregate(results: &[InferenceResult]) -> MetricsMap {
    let mut metrics = MetricsMap::new();

    let scored: Vec<bool> = results.iter().filter_map(exact_match).collect();
    if !scored.is_empty() {
        let hits = scored.iter().filter(|hit| **hit).count();
        metrics.insert(EXACT_MATCH.to_string(), percent(hits, scored.len()));
    }

    if let Some(avg) = mean(results.iter().filter_map(|r| r.latency_ms)) {
        metrics.insert(AVG_LATENCY.to_string(), avg);
    }

    if let Some(avg) = mean(results.iter().filter_map(|r| r.token_count)) {
        metrics.insert(AVG_TOKENS.to_string(), avg);
    }

    metrics
}

/// Whether a result matches its reference, or `None` without a reference
#[must_use]
pub fn exact_match(result: &InferenceResult) -> Option<bool> {
    result
        .expected_output
        .as_deref()
        .map(|expected| expected.trim() == result.actual_output.trim())
}

#[allow(clippy::cast_precision_loss)]
fn percent(hits: usize, total: usize) -> f64 {
    hits as f64 / total as f64 * 100.0
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = u64>) -> Option<f64> {
    let (sum, count) = values.fold((0u128, 0u64), |(sum, count), v| {
        (sum + u128::from(v), count + 1)
    });
    (count > 0).then(|| sum as f64 / count as f64)
}

/// Writes aggregated metrics back onto completed runs
#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn RunStore>,
}

impl MetricsAggregator {
    /// Create aggregator over a store
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Compute and store metrics for a run
    ///
    /// Replaces the run's metrics and attaches a per-result `exact_match`
    /// (1.0 or 0.0) to every result that has a reference answer.
    ///
    /// # Returns
    /// - `Ok(None)` if the run is not completed or has no results
    /// - `Ok(Some(metrics))` with the stored map otherwise
    ///
    /// # Errors
    /// - `EvalError::RunNotFound` if the run does not exist
    /// - `EvalError::Store` on persistence failure
    pub async fn compute(&self, run_id: RunId) -> Result<Option<MetricsMap>, EvalError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| EvalError::for_run(run_id, e))?;
        if run.status != RunStatus::Completed {
            tracing::debug!(%run_id, status = %run.status, "skipping metrics for unfinished run");
            return Ok(None);
        }

        let results = self.store.list_results(run_id).await?;
        if results.is_empty() {
            return Ok(None);
        }

        for result in &results {
            if let Some(hit) = exact_match(result) {
                let mut per_result = result.metrics.clone().unwrap_or_default();
                per_result.insert(EXACT_MATCH.to_string(), if hit { 1.0 } else { 0.0 });
                self.store.set_result_metrics(result.id, per_result).await?;
            }
        }

        let metrics = aggregate(&results);
        self.store.set_run_metrics(run_id, metrics.clone()).await?;
        tracing::info!(%run_id, metrics = ?metrics, "metrics stored");

        Ok(Some(metrics))
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemId, NewResult};
    use proptest::prelude::*;

    fn result(actual: &str, expected: Option<&str>, latency: Option<u64>) -> InferenceResult {
        InferenceResult::from_new(
            RunId::new(),
            NewResult {
                dataset_item_id: ItemId::new("i"),
                input: "q".into(),
                expected_output: expected.map(str::to_string),
                actual_output: actual.into(),
                error: None,
                latency_ms: latency,
                token_count: None,
                metadata: None,
            },
        )
    }

    #[test]
    fn exact_match_percentage() {
        let results = vec![
            result("Paris", Some("Paris"), None),
            result("Lyon", Some("Paris"), None),
        ];
        let metrics = aggregate(&results);
        assert_eq!(metrics[EXACT_MATCH], 50.0);
    }

    #[test]
    fn exact_match_trims_whitespace() {
        let results = vec![result("  Paris\n", Some("Paris "), None)];
        assert_eq!(aggregate(&results)[EXACT_MATCH], 100.0);
    }

    #[test]
    fn exact_match_ignores_results_without_reference() {
        let results = vec![
            result("Paris", Some("Paris"), None),
            result("anything", None, None),
        ];
        assert_eq!(aggregate(&results)[EXACT_MATCH], 100.0);

        let unscored = vec![result("anything", None, None)];
        assert!(!aggregate(&unscored).contains_key(EXACT_MATCH));
    }

    #[test]
    fn average_latency() {
        let results = vec![
            result("a", None, Some(100)),
            result("b", None, Some(300)),
            result("c", None, None),
        ];
        let metrics = aggregate(&results);
        assert_eq!(metrics[AVG_LATENCY], 200.0);
        assert!(!metrics.contains_key(AVG_TOKENS));
    }

    #[test]
    fn absent_latency_is_absent_not_zero() {
        let results = vec![result("a", None, None)];
        assert!(aggregate(&results).is_empty());
    }

    #[test]
    fn empty_results_yield_empty_map() {
        assert!(aggregate(&[]).is_empty());
    }

    proptest! {
        #[test]
        fn aggregate_stays_in_bounds(
            rows in proptest::collection::vec(
                (any::<bool>(), proptest::option::of(any::<bool>()), proptest::option::of(0u64..10_000)),
                0..40,
            )
        ) {
            let results: Vec<_> = rows
                .iter()
                .map(|(hit, has_ref, latency)| {
                    let expected = has_ref.map(|_| "yes");
                    result(if *hit { "yes" } else { "no" }, expected, *latency)
                })
                .collect();

            let metrics = aggregate(&results);
            prop_assert_eq!(&metrics, &aggregate(&results));

            let scored = rows.iter().any(|(_, has_ref, _)| has_ref.is_some());
            prop_assert_eq!(metrics.contains_key(EXACT_MATCH), scored);
            if let Some(pct) = metrics.get(EXACT_MATCH) {
                prop_assert!((0.0..=100.0).contains(pct));
            }
            if let Some(avg) = metrics.get(AVG_LATENCY) {
                prop_assert!((0.0..10_000.0).contains(avg));
            }
        }
    }
}
