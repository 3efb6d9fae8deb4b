//! Persistence contracts
//!
//! The executor and aggregator only see these traits, so any backend that
//! honors the contract (in-memory, SQLite) can be injected at construction.
//!
//! Contract shared by every [`RunStore`] implementation:
//! - each method is a single atomic write or read; a reader never observes a
//!   result without the progress that accounts for it, or the reverse
//! - `update_run_status` validates the change against
//!   [`crate::state::allowed_transitions`] in the same critical section as
//!   the write
//! - `update_run_status` forces progress to 100 and sets `completed_at` for
//!   `completed`, caps progress at 99 and clears `completed_at` otherwise,
//!   and clears stale metrics and results when a run (re)enters `running`
//! - `append_result` only accepts results for a `running` run and raises
//!   progress monotonically
//! - `list_runs` returns newest first; `list_results` returns insertion order

use crate::error::StoreError;
use crate::types::{
    Dataset, DatasetId, DatasetItem, InferenceResult, InferenceRun, MetricsMap, NewDataset,
    NewResult, NewRun, ResultId, RunFilter, RunId, RunStatus,
};
use async_trait::async_trait;

/// Store for inference runs and their results
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a pending run with progress 0
    async fn create_run(&self, new: NewRun) -> Result<InferenceRun, StoreError>;

    /// Point read
    async fn get_run(&self, id: RunId) -> Result<InferenceRun, StoreError>;

    /// Validated status write
    ///
    /// Entering `running` also drops the run's results in the same write, so
    /// readers never see a running run next to results from an earlier pass.
    ///
    /// # Errors
    /// - `StoreError::NotFound` if the run does not exist
    /// - `StoreError::InvalidTransition` if the lifecycle forbids the change
    async fn update_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        progress: u8,
        error: Option<String>,
    ) -> Result<InferenceRun, StoreError>;

    /// Drop every result of a run
    async fn delete_results(&self, run_id: RunId) -> Result<(), StoreError>;

    /// Append one result and recompute the run's progress against `total_items`
    ///
    /// # Errors
    /// - `StoreError::NotFound` if the run does not exist
    /// - `StoreError::Conflict` if the run is not running
    async fn append_result(
        &self,
        run_id: RunId,
        result: NewResult,
        total_items: usize,
    ) -> Result<InferenceResult, StoreError>;

    /// Replace a run's aggregated metrics
    async fn set_run_metrics(&self, run_id: RunId, metrics: MetricsMap) -> Result<(), StoreError>;

    /// Replace one result's metrics
    async fn set_result_metrics(
        &self,
        result_id: ResultId,
        metrics: MetricsMap,
    ) -> Result<(), StoreError>;

    /// Filtered listing, newest first
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<InferenceRun>, StoreError>;

    /// A run's results in insertion order
    async fn list_results(&self, run_id: RunId) -> Result<Vec<InferenceResult>, StoreError>;

    /// Delete a run and cascade to its results
    async fn delete_run(&self, id: RunId) -> Result<(), StoreError>;
}

/// Read-only source of dataset items
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Items of a dataset, in dataset order
    ///
    /// # Errors
    /// `StoreError::NotFound` if the dataset does not exist
    async fn list_items(&self, dataset_id: &DatasetId) -> Result<Vec<DatasetItem>, StoreError>;
}

/// Dataset management on top of [`DatasetSource`]
#[async_trait]
pub trait DatasetStore: DatasetSource {
    /// Create a dataset; fails with `StoreError::Conflict` on a duplicate id
    async fn create_dataset(&self, new: NewDataset) -> Result<Dataset, StoreError>;

    /// Point read including items
    async fn get_dataset(&self, id: &DatasetId) -> Result<Dataset, StoreError>;

    /// All datasets, newest first
    async fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError>;

    /// Delete a dataset and its items
    async fn delete_dataset(&self, id: &DatasetId) -> Result<(), StoreError>;
}

/// Apply a validated status write to an in-memory run row.
///
/// Shared by backends so every store enforces the same field rules.
pub fn apply_status(
    run: &mut InferenceRun,
    status: RunStatus,
    progress: u8,
    error: Option<String>,
) -> Result<(), StoreError> {
    crate::state::validate_transition(run.status, status)?;

    let now = chrono::Utc::now();
    match status {
        RunStatus::Completed => {
            run.progress = 100;
            run.completed_at = Some(now);
        }
        RunStatus::Running => {
            run.progress = progress.min(99);
            run.completed_at = None;
            run.metrics = None;
        }
        RunStatus::Pending | RunStatus::Failed => {
            run.progress = progress.min(99);
            run.completed_at = None;
        }
    }
    run.status = status;
    run.error = error;
    run.updated_at = now;
    Ok(())
}

/// Order runs newest first (ULIDs break timestamp ties).
pub fn sort_newest_first(runs: &mut [InferenceRun]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}
