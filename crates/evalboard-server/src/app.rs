//! Service wiring: store, providers and executor behind one handle

use crate::config::{AppConfig, ConfigError, StorageBackend};
use crate::provider::ProviderRouter;
use evalboard_core::{
    DatasetId, DatasetStore, EvalError, ExecutorConfig, InMemoryStore, InferenceRun, Leaderboard,
    MetricsAggregator, NewDataset, NewRun, ResponseGenerator, RunExecutor, RunOutcome, RunStatus,
    RunStore,
};
use evalboard_sqlite::{SqliteError, SqliteStore};
use std::sync::Arc;

/// Errors while assembling the service
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Bad provider or executor settings
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store could not be opened
    #[error("failed to open store: {0}")]
    Storage(#[from] SqliteError),
}

/// Shared application state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    /// Runs and results
    pub runs: Arc<dyn RunStore>,
    /// Datasets
    pub datasets: Arc<dyn DatasetStore>,
    /// Run executor
    pub executor: Arc<RunExecutor>,
    /// Metrics aggregator
    pub aggregator: MetricsAggregator,
    /// Leaderboard
    pub leaderboard: Leaderboard,
}

impl AppState {
    /// Wire services around one store that holds both runs and datasets
    pub fn new<S>(
        store: Arc<S>,
        generator: Arc<dyn ResponseGenerator>,
        config: ExecutorConfig,
    ) -> Self
    where
        S: RunStore + DatasetStore + 'static,
    {
        let executor = RunExecutor::new(store.clone(), store.clone(), generator).with_config(config);
        Self {
            runs: store.clone(),
            datasets: store.clone(),
            executor: Arc::new(executor),
            aggregator: MetricsAggregator::new(store.clone()),
            leaderboard: Leaderboard::new(store),
        }
    }

    /// Build from configuration, opening the configured store
    pub fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let router = Arc::new(ProviderRouter::from_config(&config.providers)?);
        let executor = config.executor.clone();

        let state = match config.storage.backend {
            StorageBackend::Memory => {
                tracing::info!("using in-memory store");
                Self::new(Arc::new(InMemoryStore::new()), router, executor)
            }
            StorageBackend::Sqlite => {
                let store = SqliteStore::open(&config.storage.path)?;
                Self::new(Arc::new(store), router, executor)
            }
        };
        Ok(state)
    }

    /// Fail runs left `running` by a previous process
    ///
    /// Only a long-lived server should call this: any other process sharing
    /// the store would fail runs that a live server is still driving.
    pub async fn recover(&self) -> Result<usize, EvalError> {
        Ok(self.executor.recover_interrupted().await?.len())
    }

    /// Run `new` against `dataset` to the end and return the final run
    ///
    /// The dataset is reused when one with the same id already exists.
    /// Metrics are computed when the run completes. Other runs in the store
    /// are left untouched.
    pub async fn evaluate(
        &self,
        dataset: NewDataset,
        run: impl FnOnce(DatasetId) -> NewRun,
    ) -> Result<(InferenceRun, RunOutcome), EvalError> {
        let existing = match &dataset.id {
            Some(id) => self.datasets.get_dataset(id).await.ok(),
            None => None,
        };
        let dataset = match existing {
            Some(dataset) => dataset,
            None => self.datasets.create_dataset(dataset).await?,
        };

        let run = self.runs.create_run(run(dataset.id)).await?;
        let Some(handle) = self.executor.start(run.id).await?.into_handle() else {
            return Err(EvalError::InvalidTransition {
                from: RunStatus::Running,
                to: RunStatus::Running,
            });
        };
        let outcome = handle.wait().await?;
        tracing::info!(run_id = %run.id, ?outcome, "evaluation finished");

        if let RunOutcome::Completed { .. } = outcome {
            self.aggregator.compute(run.id).await?;
        }
        let run = self
            .runs
            .get_run(run.id)
            .await
            .map_err(|e| EvalError::for_run(run.id, e))?;
        Ok((run, outcome))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
