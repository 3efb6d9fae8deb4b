//! One-shot evaluation over a shared store

use evalboard_core::{
    ExecutorConfig, InMemoryStore, NewDataset, NewRun, RunOutcome, RunStatus, RunStore,
};
use evalboard_server::AppState;
use evalboard_test_utils::{sample_items, seed_dataset, seed_run, ScriptedGenerator, TEST_DATASET};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn evaluate_leaves_foreign_running_runs_alone() {
    let store = Arc::new(InMemoryStore::new());
    let state = AppState::new(
        store.clone(),
        Arc::new(ScriptedGenerator::new()),
        ExecutorConfig::default(),
    );

    // Driven by another process sharing the store
    seed_dataset(store.as_ref(), TEST_DATASET, 3).await;
    let foreign = seed_run(store.as_ref(), TEST_DATASET).await;
    store
        .update_run_status(foreign.id, RunStatus::Running, 0, None)
        .await
        .unwrap();

    let dataset = NewDataset::new("local")
        .with_id("local")
        .with_items(sample_items(2));
    let (run, outcome) = state
        .evaluate(dataset, |dataset_id| {
            NewRun::new("one-shot", dataset_id, "mock", "m")
        })
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.dataset_id.as_str(), "local");
    assert_eq!(run.metrics.unwrap()["exact_match"], 100.0);

    let foreign = store.get_run(foreign.id).await.unwrap();
    assert_eq!(foreign.status, RunStatus::Running);
    assert_eq!(foreign.error, None);
}

#[tokio::test]
async fn evaluate_reuses_existing_dataset() {
    let store = Arc::new(InMemoryStore::new());
    let state = AppState::new(
        store.clone(),
        Arc::new(ScriptedGenerator::new()),
        ExecutorConfig::default(),
    );
    seed_dataset(store.as_ref(), TEST_DATASET, 4).await;

    let dataset = NewDataset::new("ignored").with_id(TEST_DATASET);
    let (run, _) = state
        .evaluate(dataset, |dataset_id| NewRun::new("again", dataset_id, "mock", "m"))
        .await
        .unwrap();

    assert_eq!(store.list_results(run.id).await.unwrap().len(), 4);
}
