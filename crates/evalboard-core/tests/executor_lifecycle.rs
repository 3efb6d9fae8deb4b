//! Run lifecycle tests against the in-memory store

use async_trait::async_trait;
use evalboard_core::{
    DatasetStore, EvalError, GenerationError, InMemoryStore, InferenceResult, InferenceRun,
    MetricsAggregator, MetricsMap, MockGenerator, NewDataset, NewResult, NewRun, ResultId,
    RunExecutor, RunFilter, RunId, RunOutcome, RunStatus, RunStore, StopOutcome, StoreError,
    STOPPED_MESSAGE,
};
use evalboard_test_utils::{
    memory_executor, memory_fixture, seed_run, wait_for, wait_for_terminal, GatedGenerator,
    ScriptedGenerator,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn five_items_run_to_completion() {
    let (store, run_id) = memory_fixture(5).await;
    let exec = memory_executor(&store, Arc::new(MockGenerator::instant()));

    assert!(exec.start(run_id).await.unwrap().started());
    let run = wait_for_terminal(store.as_ref(), run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.progress, 100);
    assert!(run.completed_at.is_some());

    let results = store.list_results(run_id).await.unwrap();
    let items: Vec<_> = results.iter().map(|r| r.dataset_item_id.as_str()).collect();
    assert_eq!(items, ["item-0", "item-1", "item-2", "item-3", "item-4"]);
}

#[tokio::test]
async fn progress_and_results_rise_together() {
    let (store, run_id) = memory_fixture(4).await;
    let generator = Arc::new(GatedGenerator::new());
    let exec = memory_executor(&store, generator.clone());

    exec.start(run_id).await.unwrap();

    let mut last_progress = 0;
    for done in 1..=4usize {
        generator.wait_started(done).await;
        generator.release(1);
        let target = if done < 4 { 25 * done } else { 100 };
        let run = wait_for(store.as_ref(), run_id, |r| usize::from(r.progress) >= target).await;

        assert_eq!(store.list_results(run_id).await.unwrap().len(), done);
        assert!(run.progress >= last_progress);
        last_progress = run.progress;
    }

    let run = wait_for_terminal(store.as_ref(), run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(store.list_results(run_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn rerun_replaces_previous_results() {
    let (store, run_id) = memory_fixture(3).await;
    let exec = memory_executor(&store, Arc::new(ScriptedGenerator::new()));

    let first = exec.start(run_id).await.unwrap().into_handle().unwrap();
    first.wait().await.unwrap();
    let old_ids: Vec<_> = store
        .list_results(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    MetricsAggregator::new(store.clone())
        .compute(run_id)
        .await
        .unwrap();

    let second = exec.start(run_id).await.unwrap().into_handle().unwrap();
    second.wait().await.unwrap();

    let results = store.list_results(run_id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| !old_ids.contains(&r.id)));

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.metrics.is_none(), "stale metrics survive a re-run");
}

#[tokio::test]
async fn start_while_running_is_noop() {
    let (store, run_id) = memory_fixture(2).await;
    let generator = Arc::new(GatedGenerator::new());
    let exec = memory_executor(&store, generator.clone());

    assert!(exec.start(run_id).await.unwrap().started());
    generator.wait_started(1).await;
    generator.release(1);
    wait_for(store.as_ref(), run_id, |r| r.progress > 0).await;

    let again = exec.start(run_id).await.unwrap();
    assert!(!again.started());

    // No reset happened
    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.progress, 50);
    assert_eq!(store.list_results(run_id).await.unwrap().len(), 1);

    generator.release(1);
    wait_for_terminal(store.as_ref(), run_id).await;
    assert_eq!(store.list_results(run_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_starts_never_duplicate_results() {
    let (store, run_id) = memory_fixture(3).await;
    let exec = Arc::new(memory_executor(&store, Arc::new(MockGenerator::instant())));

    let attempts = (0..8).map(|_| {
        let exec = exec.clone();
        tokio::spawn(async move { exec.start(run_id).await.unwrap().into_handle() })
    });
    let handles: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap())
        .collect();
    assert!(!handles.is_empty());
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let run = wait_for_terminal(store.as_ref(), run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    // Later starts re-run from scratch, but never duplicate items
    assert_eq!(store.list_results(run_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn empty_dataset_fails_run() {
    let (store, _) = memory_fixture(1).await;
    store
        .create_dataset(NewDataset::new("empty").with_id("empty"))
        .await
        .unwrap();
    let run = seed_run(store.as_ref(), "empty").await;
    let exec = memory_executor(&store, Arc::new(MockGenerator::instant()));

    let err = exec.start(run.id).await.unwrap_err();
    assert!(matches!(err, EvalError::EmptyDataset(_)));

    let run = store.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.progress, 0);
    assert!(!run.error.unwrap_or_default().is_empty());
    assert!(store.list_results(run.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn stop_halts_in_flight_run() {
    let (store, run_id) = memory_fixture(5).await;
    let generator = Arc::new(GatedGenerator::new());
    let exec = memory_executor(&store, generator.clone());

    let handle = exec.start(run_id).await.unwrap().into_handle().unwrap();
    generator.release(2);
    generator.wait_started(3).await;

    assert_eq!(exec.stop(run_id).await.unwrap(), StopOutcome::Stopped);
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome, RunOutcome::Stopped { processed: 2 });

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(STOPPED_MESSAGE));
    assert_eq!(run.progress, 40);
    assert_eq!(store.list_results(run_id).await.unwrap().len(), 2);
    assert_eq!(generator.started(), 3);
    assert!(!exec.is_active(run_id));

    assert_eq!(exec.stop(run_id).await.unwrap(), StopOutcome::NotRunning);
}

#[tokio::test]
async fn stopped_run_can_be_restarted() {
    let (store, run_id) = memory_fixture(2).await;
    let generator = Arc::new(GatedGenerator::new());
    let exec = memory_executor(&store, generator.clone());

    let handle = exec.start(run_id).await.unwrap().into_handle().unwrap();
    generator.wait_started(1).await;
    exec.stop(run_id).await.unwrap();
    handle.wait().await.unwrap();

    generator.release(2);
    let handle = exec.start(run_id).await.unwrap().into_handle().unwrap();
    assert!(matches!(
        handle.wait().await.unwrap(),
        RunOutcome::Completed { results: 2, .. }
    ));

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.error.is_none());
}

#[tokio::test]
async fn recorded_failure_keeps_run_going() {
    let (store, run_id) = memory_fixture(3).await;
    let generator = ScriptedGenerator::new()
        .fail_input("question 1", GenerationError::Provider("refused".into()));
    let exec = memory_executor(&store, Arc::new(generator));

    exec.start(run_id).await.unwrap();
    let run = wait_for_terminal(store.as_ref(), run_id).await;
    assert_eq!(run.status, RunStatus::Completed);

    let results = store.list_results(run_id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[1].error.as_deref().unwrap().contains("refused"));

    let metrics = MetricsAggregator::new(store.clone())
        .compute(run_id)
        .await
        .unwrap()
        .unwrap();
    let expected = 2.0 / 3.0 * 100.0;
    assert!((metrics["exact_match"] - expected).abs() < 1e-9);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (store, run_id) = memory_fixture(2).await;
    let generator = Arc::new(ScriptedGenerator::new().fail_first(
        "question 0",
        2,
        GenerationError::Http {
            status: 503,
            body: "busy".into(),
        },
    ));
    let exec = memory_executor(&store, generator.clone());

    exec.start(run_id).await.unwrap().into_handle().unwrap().wait().await.unwrap();

    let results = store.list_results(run_id).await.unwrap();
    assert!(results.iter().all(|r| r.error.is_none()));
    assert_eq!(generator.calls(), 4);
}

#[tokio::test]
async fn recovery_fails_orphaned_runs() {
    let (store, run_id) = memory_fixture(2).await;
    store
        .update_run_status(run_id, RunStatus::Running, 0, None)
        .await
        .unwrap();

    let exec = memory_executor(&store, Arc::new(MockGenerator::instant()));
    assert_eq!(exec.recover_interrupted().await.unwrap(), vec![run_id]);
    assert_eq!(
        store.get_run(run_id).await.unwrap().status,
        RunStatus::Failed
    );

    // A restarted run goes through normally
    exec.start(run_id).await.unwrap().into_handle().unwrap().wait().await.unwrap();
    assert_eq!(
        store.get_run(run_id).await.unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn aggregation_is_idempotent() {
    let (store, run_id) = memory_fixture(4).await;
    let exec = memory_executor(&store, Arc::new(ScriptedGenerator::new()));
    exec.start(run_id).await.unwrap().into_handle().unwrap().wait().await.unwrap();

    let aggregator = MetricsAggregator::new(store.clone());
    let first = aggregator.compute(run_id).await.unwrap();
    let second = aggregator.compute(run_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.unwrap()["exact_match"], 100.0);
    assert_eq!(store.get_run(run_id).await.unwrap().metrics, second);

    let results = store.list_results(run_id).await.unwrap();
    assert!(results
        .iter()
        .all(|r| r.metrics.as_ref().unwrap()["exact_match"] == 1.0));
}

#[tokio::test]
async fn aggregation_skips_unfinished_runs() {
    let (store, run_id) = memory_fixture(1).await;
    let aggregator = MetricsAggregator::new(store.clone());
    assert_eq!(aggregator.compute(run_id).await.unwrap(), None);
    assert!(store.get_run(run_id).await.unwrap().metrics.is_none());

    let err = aggregator
        .compute(RunId::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

/// Records what a reader sees right after each successful claim
struct ClaimWatcher {
    inner: Arc<InMemoryStore>,
    seen: Mutex<Vec<(RunStatus, u8, usize)>>,
}

#[async_trait]
impl RunStore for ClaimWatcher {
    async fn create_run(&self, new: NewRun) -> Result<InferenceRun, StoreError> {
        self.inner.create_run(new).await
    }

    async fn get_run(&self, id: RunId) -> Result<InferenceRun, StoreError> {
        self.inner.get_run(id).await
    }

    async fn update_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        progress: u8,
        error: Option<String>,
    ) -> Result<InferenceRun, StoreError> {
        let run = self
            .inner
            .update_run_status(id, status, progress, error)
            .await?;
        if status == RunStatus::Running {
            let visible = self.inner.get_run(id).await?;
            let results = self.inner.list_results(id).await?.len();
            self.seen.lock().push((visible.status, visible.progress, results));
        }
        Ok(run)
    }

    async fn delete_results(&self, run_id: RunId) -> Result<(), StoreError> {
        self.inner.delete_results(run_id).await
    }

    async fn append_result(
        &self,
        run_id: RunId,
        result: NewResult,
        total_items: usize,
    ) -> Result<InferenceResult, StoreError> {
        self.inner.append_result(run_id, result, total_items).await
    }

    async fn set_run_metrics(&self, run_id: RunId, metrics: MetricsMap) -> Result<(), StoreError> {
        self.inner.set_run_metrics(run_id, metrics).await
    }

    async fn set_result_metrics(
        &self,
        result_id: ResultId,
        metrics: MetricsMap,
    ) -> Result<(), StoreError> {
        self.inner.set_result_metrics(result_id, metrics).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<InferenceRun>, StoreError> {
        self.inner.list_runs(filter).await
    }

    async fn list_results(&self, run_id: RunId) -> Result<Vec<InferenceResult>, StoreError> {
        self.inner.list_results(run_id).await
    }

    async fn delete_run(&self, id: RunId) -> Result<(), StoreError> {
        self.inner.delete_run(id).await
    }
}

#[tokio::test]
async fn rerun_claim_never_shows_stale_results() {
    let (store, run_id) = memory_fixture(4).await;
    let watcher = Arc::new(ClaimWatcher {
        inner: store.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let exec = RunExecutor::new(
        watcher.clone(),
        store.clone(),
        Arc::new(MockGenerator::instant()),
    );

    for _ in 0..2 {
        exec.start(run_id)
            .await
            .unwrap()
            .into_handle()
            .unwrap()
            .wait()
            .await
            .unwrap();
    }

    assert_eq!(
        *watcher.seen.lock(),
        [(RunStatus::Running, 0, 0), (RunStatus::Running, 0, 0)]
    );
    assert_eq!(store.list_results(run_id).await.unwrap().len(), 4);
}
