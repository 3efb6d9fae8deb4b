//! Testing utilities for the evalboard workspace
//!
//! Shared fixtures, scripted generators, and polling helpers.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use evalboard_core::{
    Dataset, DatasetItem, DatasetStore, ExecutorConfig, Generation, GenerationError,
    GenerationRequest, InMemoryStore, InferenceRun, NewDataset, NewRun, ResponseGenerator,
    RunExecutor, RunId, RunStatus, RunStore,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const TEST_DATASET: &str = "qa";
pub const TEST_PROVIDER: &str = "mock";
pub const TEST_MODEL: &str = "test-model";

/// `n` items `item-{i}` asking `question {i}` with reference `answer {i}`
pub fn sample_items(n: usize) -> Vec<DatasetItem> {
    (0..n)
        .map(|i| {
            DatasetItem::new(format!("item-{i}"), format!("question {i}"))
                .with_expected(format!("answer {i}"))
        })
        .collect()
}

pub async fn seed_dataset(store: &dyn DatasetStore, id: &str, items: usize) -> Dataset {
    store
        .create_dataset(
            NewDataset::new(format!("{id} dataset"))
                .with_id(id)
                .with_items(sample_items(items)),
        )
        .await
        .unwrap()
}

pub async fn seed_run(store: &dyn RunStore, dataset_id: &str) -> InferenceRun {
    store
        .create_run(NewRun::new("test run", dataset_id, TEST_PROVIDER, TEST_MODEL))
        .await
        .unwrap()
}

/// In-memory store with a dataset of `items` items and one pending run on it
pub async fn memory_fixture(items: usize) -> (Arc<InMemoryStore>, RunId) {
    let store = Arc::new(InMemoryStore::new());
    seed_dataset(store.as_ref(), TEST_DATASET, items).await;
    let run = seed_run(store.as_ref(), TEST_DATASET).await;
    (store, run.id)
}

/// Executor over an in-memory store, without retry backoff
pub fn memory_executor(
    store: &Arc<InMemoryStore>,
    generator: Arc<dyn ResponseGenerator>,
) -> RunExecutor {
    RunExecutor::new(store.clone(), store.clone(), generator)
        .with_config(ExecutorConfig::new().with_retries(2, Duration::ZERO))
}

/// Poll until the run leaves `running`
pub async fn wait_for_terminal(store: &dyn RunStore, run_id: RunId) -> InferenceRun {
    wait_for(store, run_id, |run| run.status != RunStatus::Running).await
}

/// Poll until `predicate` holds for the run, panicking after 5 seconds
pub async fn wait_for(
    store: &dyn RunStore,
    run_id: RunId,
    predicate: impl Fn(&InferenceRun) -> bool,
) -> InferenceRun {
    let poll = async {
        loop {
            let run = store.get_run(run_id).await.unwrap();
            if predicate(&run) {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("run did not reach the expected state in time")
}

/// Generator that answers from a script and counts calls
///
/// By default it echoes `answer {n}` for `question {n}`, so sample items
/// score as exact matches.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    permanent: HashMap<String, GenerationError>,
    transient: Mutex<HashMap<String, (usize, GenerationError)>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always fail `input` with `error`
    #[must_use]
    pub fn fail_input(mut self, input: &str, error: GenerationError) -> Self {
        self.permanent.insert(input.to_string(), error);
        self
    }

    /// Fail the first `times` calls for `input`, then answer normally
    #[must_use]
    pub fn fail_first(self, input: &str, times: usize, error: GenerationError) -> Self {
        self.transient
            .lock()
            .insert(input.to_string(), (times, error));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.permanent.get(&request.input) {
            return Err(error.clone());
        }
        if let Some((remaining, error)) = self.transient.lock().get_mut(&request.input) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }

        Ok(Generation {
            output: request.input.replace("question", "answer"),
            latency_ms: 10,
            token_count: Some(4),
        })
    }
}

/// Generator whose calls block until released, for deterministic stop tests
#[derive(Debug)]
pub struct GatedGenerator {
    gate: Semaphore,
    started: AtomicUsize,
}

impl GatedGenerator {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        }
    }

    /// Let `n` pending or future calls complete
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Calls that have entered `generate`
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` calls have entered `generate`
    pub async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started() < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("generator was not called in time");
    }
}

impl Default for GatedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseGenerator for GatedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| GenerationError::Provider(e.to_string()))?;
        permit.forget();

        Ok(Generation {
            output: format!("gated: {}", request.input),
            latency_ms: 1,
            token_count: None,
        })
    }
}
