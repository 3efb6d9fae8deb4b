//! In-memory store
//!
//! Runs and results live behind a single `RwLock` so that a result insert
//! and the progress update it implies are one critical section. Datasets
//! are read-mostly and independent, so they sit in a `DashMap`.

use crate::error::StoreError;
use crate::store::{apply_status, sort_newest_first, DatasetSource, DatasetStore, RunStore};
use crate::types::{
    running_progress, Dataset, DatasetId, DatasetItem, InferenceResult, InferenceRun,
    MetricsMap, NewDataset, NewResult, NewRun, ResultId, RunFilter, RunId, RunStatus,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, InferenceRun>,
    results: HashMap<RunId, Vec<InferenceResult>>,
    result_owner: HashMap<ResultId, RunId>,
}

impl Tables {
    fn clear_results(&mut self, run_id: RunId) {
        let removed = self.results.insert(run_id, Vec::new()).unwrap_or_default();
        for result in removed {
            self.result_owner.remove(&result.id);
        }
    }
}

/// Process-local store, used by tests and the `memory` storage backend
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    datasets: DashMap<DatasetId, Dataset>,
}

impl InMemoryStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.tables.read().runs.len()
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn create_run(&self, new: NewRun) -> Result<InferenceRun, StoreError> {
        let run = InferenceRun::from_new(new);
        let mut tables = self.tables.write();
        tables.runs.insert(run.id, run.clone());
        tables.results.insert(run.id, Vec::new());
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> Result<InferenceRun, StoreError> {
        self.tables
            .read()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::run_not_found(id))
    }

    async fn update_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        progress: u8,
        error: Option<String>,
    ) -> Result<InferenceRun, StoreError> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let run = tables
            .runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::run_not_found(id))?;
        apply_status(run, status, progress, error)?;
        let run = run.clone();
        if status == RunStatus::Running {
            tables.clear_results(id);
        }
        Ok(run)
    }

    async fn delete_results(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.runs.contains_key(&run_id) {
            return Err(StoreError::run_not_found(run_id));
        }
        tables.clear_results(run_id);
        Ok(())
    }

    async fn append_result(
        &self,
        run_id: RunId,
        result: NewResult,
        total_items: usize,
    ) -> Result<InferenceResult, StoreError> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::run_not_found(run_id))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::Conflict(format!(
                "run {run_id} is {}, not running",
                run.status
            )));
        }

        let row = InferenceResult::from_new(run_id, result);
        let results = tables.results.entry(run_id).or_default();
        results.push(row.clone());

        run.progress = run.progress.max(running_progress(results.len(), total_items));
        run.updated_at = row.created_at;
        tables.result_owner.insert(row.id, run_id);

        Ok(row)
    }

    async fn set_run_metrics(&self, run_id: RunId, metrics: MetricsMap) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::run_not_found(run_id))?;
        run.metrics = Some(metrics);
        run.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_result_metrics(
        &self,
        result_id: ResultId,
        metrics: MetricsMap,
    ) -> Result<(), StoreError> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let run_id = tables
            .result_owner
            .get(&result_id)
            .copied()
            .ok_or_else(|| StoreError::result_not_found(result_id))?;
        let result = tables
            .results
            .get_mut(&run_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == result_id))
            .ok_or_else(|| StoreError::result_not_found(result_id))?;
        result.metrics = Some(metrics);
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<InferenceRun>, StoreError> {
        let mut runs: Vec<_> = self
            .tables
            .read()
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_newest_first(&mut runs);
        Ok(runs)
    }

    async fn list_results(&self, run_id: RunId) -> Result<Vec<InferenceResult>, StoreError> {
        let tables = self.tables.read();
        if !tables.runs.contains_key(&run_id) {
            return Err(StoreError::run_not_found(run_id));
        }
        Ok(tables.results.get(&run_id).cloned().unwrap_or_default())
    }

    async fn delete_run(&self, id: RunId) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.runs.remove(&id).is_none() {
            return Err(StoreError::run_not_found(id));
        }
        let removed = tables.results.remove(&id).unwrap_or_default();
        for result in removed {
            tables.result_owner.remove(&result.id);
        }
        Ok(())
    }
}

#[async_trait]
impl DatasetSource for InMemoryStore {
    async fn list_items(&self, dataset_id: &DatasetId) -> Result<Vec<DatasetItem>, StoreError> {
        self.datasets
            .get(dataset_id)
            .map(|d| d.items.clone())
            .ok_or_else(|| StoreError::dataset_not_found(dataset_id))
    }
}

#[async_trait]
impl DatasetStore for InMemoryStore {
    async fn create_dataset(&self, new: NewDataset) -> Result<Dataset, StoreError> {
        let dataset = Dataset::from_new(new);
        match self.datasets.entry(dataset.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "dataset {} already exists",
                dataset.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(dataset.clone());
                Ok(dataset)
            }
        }
    }

    async fn get_dataset(&self, id: &DatasetId) -> Result<Dataset, StoreError> {
        self.datasets
            .get(id)
            .map(|d| d.clone())
            .ok_or_else(|| StoreError::dataset_not_found(id))
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        let mut all: Vec<Dataset> = self.datasets.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all)
    }

    async fn delete_dataset(&self, id: &DatasetId) -> Result<(), StoreError> {
        self.datasets
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::dataset_not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemId;
    use pretty_assertions::assert_eq;

    fn new_result(n: usize) -> NewResult {
        NewResult {
            dataset_item_id: ItemId::new(format!("item-{n}")),
            input: format!("q{n}"),
            expected_output: None,
            actual_output: format!("a{n}"),
            error: None,
            latency_ms: Some(10),
            token_count: Some(3),
            metadata: None,
        }
    }

    async fn running_run(store: &InMemoryStore) -> InferenceRun {
        let run = store
            .create_run(NewRun::new("r", "ds", "mock", "m"))
            .await
            .unwrap();
        store
            .update_run_status(run.id, RunStatus::Running, 0, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_run() {
        let store = InMemoryStore::new();
        let run = store
            .create_run(NewRun::new("r", "ds", "mock", "m"))
            .await
            .unwrap();

        let fetched = store.get_run(run.id).await.unwrap();
        assert_eq!(fetched, run);
        assert_eq!(store.run_count(), 1);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get_run(RunId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "run", .. }));
    }

    #[tokio::test]
    async fn append_result_updates_progress() {
        let store = InMemoryStore::new();
        let run = running_run(&store).await;

        store.append_result(run.id, new_result(0), 4).await.unwrap();
        assert_eq!(store.get_run(run.id).await.unwrap().progress, 25);

        store.append_result(run.id, new_result(1), 4).await.unwrap();
        store.append_result(run.id, new_result(2), 4).await.unwrap();
        store.append_result(run.id, new_result(3), 4).await.unwrap();

        // Last item leaves room for the completion write
        assert_eq!(store.get_run(run.id).await.unwrap().progress, 99);

        let results = store.list_results(run.id).await.unwrap();
        let inputs: Vec<_> = results.iter().map(|r| r.input.as_str()).collect();
        assert_eq!(inputs, vec!["q0", "q1", "q2", "q3"]);
    }

    #[tokio::test]
    async fn append_rejected_unless_running() {
        let store = InMemoryStore::new();
        let run = store
            .create_run(NewRun::new("r", "ds", "mock", "m"))
            .await
            .unwrap();

        let err = store.append_result(run.id, new_result(0), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.list_results(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_run_cascades() {
        let store = InMemoryStore::new();
        let run = running_run(&store).await;
        let row = store.append_result(run.id, new_result(0), 2).await.unwrap();

        store.delete_run(run.id).await.unwrap();
        assert!(store.list_results(run.id).await.is_err());
        assert!(store
            .set_result_metrics(row.id, MetricsMap::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn result_metrics_attach_after_the_fact() {
        let store = InMemoryStore::new();
        let run = running_run(&store).await;
        let row = store.append_result(run.id, new_result(0), 1).await.unwrap();

        let metrics = MetricsMap::from([("exact_match".to_string(), 1.0)]);
        store.set_result_metrics(row.id, metrics.clone()).await.unwrap();

        let stored = store.list_results(run.id).await.unwrap();
        assert_eq!(stored[0].metrics, Some(metrics));
        assert_eq!(stored[0].actual_output, "a0");
    }

    #[tokio::test]
    async fn list_runs_filters_and_orders() {
        let store = InMemoryStore::new();
        let a = store
            .create_run(NewRun::new("a", "ds1", "mock", "m1"))
            .await
            .unwrap();
        let b = store
            .create_run(NewRun::new("b", "ds2", "mock", "m1"))
            .await
            .unwrap();
        let c = store
            .create_run(NewRun::new("c", "ds1", "mock", "m2"))
            .await
            .unwrap();

        let all = store.list_runs(&RunFilter::all()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c.id, b.id, a.id]);

        let ds1 = store
            .list_runs(&RunFilter::all().with_dataset("ds1"))
            .await
            .unwrap();
        assert_eq!(ds1.len(), 2);

        let m1_ds2 = store
            .list_runs(&RunFilter::all().with_model("m1").with_dataset("ds2"))
            .await
            .unwrap();
        assert_eq!(m1_ds2.len(), 1);
        assert_eq!(m1_ds2[0].id, b.id);
    }

    #[tokio::test]
    async fn dataset_crud() {
        let store = InMemoryStore::new();
        let ds = store
            .create_dataset(
                NewDataset::new("qa")
                    .with_id("qa")
                    .with_items(vec![DatasetItem::new("i1", "q1").with_expected("a1")]),
            )
            .await
            .unwrap();

        assert_eq!(store.list_items(&ds.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.create_dataset(NewDataset::new("dup").with_id("qa")).await,
            Err(StoreError::Conflict(_))
        ));

        store.delete_dataset(&ds.id).await.unwrap();
        assert!(store.get_dataset(&ds.id).await.is_err());
    }
}
