//! Inference run executor
//!
//! Drives a run through `pending → running → {completed, failed}`:
//! 1. **Start**: claim the run with a validated `→ running` write, drop old
//!    results, load the dataset, spawn a worker
//! 2. **Loop**: the worker pops items from an ordered queue, checks for
//!    cancellation, generates, appends the result (which advances progress)
//! 3. **Finish**: `→ completed` with progress 100, or `→ failed` with a message
//!
//! # Cancellation
//!
//! [`RunExecutor::stop`] trips the run's [`CancelToken`] and writes
//! `running → failed`. The worker notices at the next checkpoint: before an
//! item, or while awaiting the generator (the in-flight call is dropped and
//! produces no result).

use crate::cancel::CancelToken;
use crate::config::{ExecutorConfig, FailurePolicy};
use crate::error::{EvalError, GenerationError, StoreError};
use crate::generator::ResponseGenerator;
use crate::metrics::MetricsAggregator;
use crate::store::{DatasetSource, RunStore};
use crate::types::{
    DatasetItem, GenerationRequest, InferenceRun, ModelId, NewResult, ProviderId, RunFilter,
    RunId, RunStatus,
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Error stored on runs stopped through [`RunExecutor::stop`]
pub const STOPPED_MESSAGE: &str = "stopped by user";

/// Error stored on runs found `running` without a live worker
pub const INTERRUPTED_MESSAGE: &str = "interrupted: executor restarted";

/// Result of a start request
#[derive(Debug)]
pub enum StartOutcome {
    /// Worker spawned
    Started(RunHandle),
    /// Run was already running; nothing changed
    AlreadyRunning,
}

impl StartOutcome {
    /// Whether a worker was spawned
    #[inline]
    #[must_use]
    pub fn started(&self) -> bool {
        matches!(self, Self::Started(_))
    }

    /// Worker handle, if one was spawned
    #[inline]
    #[must_use]
    pub fn into_handle(self) -> Option<RunHandle> {
        match self {
            Self::Started(handle) => Some(handle),
            Self::AlreadyRunning => None,
        }
    }
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Run moved to failed; worker cancelled
    Stopped,
    /// Run was not running; nothing changed
    NotRunning,
}

/// How a worker left its loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every item processed; run completed
    Completed {
        /// Results written
        results: usize,
        /// Results that carry a generation error
        failed_items: usize,
    },
    /// Status left `running` under the worker (stop or recovery)
    Stopped {
        /// Results written before stopping
        processed: usize,
    },
    /// Run failed under the abort policy
    Failed {
        /// Error stored on the run
        error: String,
    },
}

/// Handle on a spawned run worker
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    join: JoinHandle<Result<RunOutcome, EvalError>>,
}

impl RunHandle {
    /// Run driven by this worker
    #[inline]
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Wait for the worker to exit
    pub async fn wait(self) -> Result<RunOutcome, EvalError> {
        self.join
            .await
            .map_err(|e| EvalError::Join(e.to_string()))?
    }
}

/// Executes inference runs against injected store, dataset and generator
pub struct RunExecutor {
    store: Arc<dyn RunStore>,
    datasets: Arc<dyn DatasetSource>,
    generator: Arc<dyn ResponseGenerator>,
    config: ExecutorConfig,
    active: Arc<DashMap<RunId, CancelToken>>,
}

impl RunExecutor {
    /// Create executor with default configuration
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        datasets: Arc<dyn DatasetSource>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            store,
            datasets,
            generator,
            config: ExecutorConfig::default(),
            active: Arc::new(DashMap::new()),
        }
    }

    /// With configuration
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Get configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether this executor has a live worker for the run
    #[inline]
    #[must_use]
    pub fn is_active(&self, run_id: RunId) -> bool {
        self.active.contains_key(&run_id)
    }

    /// Number of live workers
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start (or re-start) a run
    ///
    /// # Returns
    /// - `StartOutcome::AlreadyRunning` if the run is running; nothing changes
    /// - `StartOutcome::Started` with the worker handle otherwise
    ///
    /// # Errors
    /// - `EvalError::RunNotFound` if the run does not exist
    /// - `EvalError::DatasetNotFound` / `EvalError::EmptyDataset`; the run is
    ///   left `failed` with the message
    /// - `EvalError::Store` on persistence failure
    pub async fn start(&self, run_id: RunId) -> Result<StartOutcome, EvalError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| EvalError::for_run(run_id, e))?;
        if run.status == RunStatus::Running {
            tracing::info!(%run_id, "start ignored: run already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        // Claim and clear in one write; a concurrent start loses here
        let run = match self
            .store
            .update_run_status(run_id, RunStatus::Running, 0, None)
            .await
        {
            Ok(run) => run,
            Err(StoreError::InvalidTransition {
                from: RunStatus::Running,
                ..
            }) => {
                tracing::info!(%run_id, "start ignored: lost race to another start");
                return Ok(StartOutcome::AlreadyRunning);
            }
            Err(e) => return Err(EvalError::for_run(run_id, e)),
        };

        let items = match self.prepare(&run).await {
            Ok(items) => items,
            Err(err) => {
                self.fail_start(run_id, &err).await;
                return Err(err);
            }
        };

        let token = CancelToken::new();
        self.active.insert(run_id, token.clone());

        let worker = RunWorker {
            run_id,
            provider_id: run.provider_id.clone(),
            model_id: run.model_id.clone(),
            total: items.len(),
            queue: VecDeque::from(items),
            store: Arc::clone(&self.store),
            generator: Arc::clone(&self.generator),
            config: self.config.clone(),
            token: token.clone(),
        };

        let active = Arc::clone(&self.active);
        let span = tracing::info_span!("run", %run_id, model = %run.model_id);
        let join = tokio::spawn(
            async move {
                let outcome = worker.run().await;
                active.remove_if(&run_id, |_, t| t.same_as(&token));
                outcome
            }
            .instrument(span),
        );

        tracing::info!(%run_id, dataset = %run.dataset_id, "run started");
        Ok(StartOutcome::Started(RunHandle { run_id, join }))
    }

    /// Load the items to process; the claim already cleared old results
    async fn prepare(&self, run: &InferenceRun) -> Result<Vec<DatasetItem>, EvalError> {
        let items = match self.datasets.list_items(&run.dataset_id).await {
            Ok(items) => items,
            Err(StoreError::NotFound { .. }) => {
                return Err(EvalError::DatasetNotFound(run.dataset_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        if items.is_empty() {
            return Err(EvalError::EmptyDataset(run.dataset_id.clone()));
        }
        Ok(items)
    }

    /// Record a start-time failure on the run; the original error wins
    async fn fail_start(&self, run_id: RunId, err: &EvalError) {
        tracing::warn!(%run_id, error = %err, "run failed to start");
        if let Err(mark) = self
            .store
            .update_run_status(run_id, RunStatus::Failed, 0, Some(err.to_string()))
            .await
        {
            tracing::error!(%run_id, error = %mark, "could not mark run failed");
        }
    }

    /// Stop a running run
    ///
    /// Cancels the worker (if this executor owns it) and writes
    /// `running → failed` with [`STOPPED_MESSAGE`]. Progress is kept.
    ///
    /// # Errors
    /// - `EvalError::RunNotFound` if the run does not exist
    pub async fn stop(&self, run_id: RunId) -> Result<StopOutcome, EvalError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| EvalError::for_run(run_id, e))?;
        if run.status != RunStatus::Running {
            return Ok(StopOutcome::NotRunning);
        }

        let token = self.active.get(&run_id).map(|t| t.value().clone());
        if let Some(token) = token {
            token.cancel();
        }

        match self
            .store
            .update_run_status(
                run_id,
                RunStatus::Failed,
                run.progress,
                Some(STOPPED_MESSAGE.to_string()),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(%run_id, progress = run.progress, "run stopped");
                Ok(StopOutcome::Stopped)
            }
            // Worker finished between the read and the write
            Err(StoreError::InvalidTransition { .. }) => Ok(StopOutcome::NotRunning),
            Err(e) => Err(EvalError::for_run(run_id, e)),
        }
    }

    /// Fail every `running` run that has no live worker in this executor
    ///
    /// Called at startup so runs orphaned by a crash do not stay `running`.
    pub async fn recover_interrupted(&self) -> Result<Vec<RunId>, EvalError> {
        let running = self
            .store
            .list_runs(&RunFilter::all().with_status(RunStatus::Running))
            .await?;

        let mut recovered = Vec::new();
        for run in running {
            if self.is_active(run.id) {
                continue;
            }
            match self
                .store
                .update_run_status(
                    run.id,
                    RunStatus::Failed,
                    run.progress,
                    Some(INTERRUPTED_MESSAGE.to_string()),
                )
                .await
            {
                Ok(_) => recovered.push(run.id),
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "marked interrupted runs as failed");
        }
        Ok(recovered)
    }
}

impl std::fmt::Debug for RunExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunExecutor")
            .field("config", &self.config)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of one item
enum ItemStep {
    Generated(NewResult),
    Failed {
        error: GenerationError,
        attempts: u32,
    },
    Cancelled,
}

/// Per-run worker consuming an ordered queue of pending items
struct RunWorker {
    run_id: RunId,
    provider_id: ProviderId,
    model_id: ModelId,
    total: usize,
    queue: VecDeque<DatasetItem>,
    store: Arc<dyn RunStore>,
    generator: Arc<dyn ResponseGenerator>,
    config: ExecutorConfig,
    token: CancelToken,
}

impl RunWorker {
    async fn run(self) -> Result<RunOutcome, EvalError> {
        let run_id = self.run_id;
        let store = Arc::clone(&self.store);
        let auto_metrics = self.config.auto_metrics;

        match self.drive().await {
            Ok(outcome) => {
                if auto_metrics && matches!(outcome, RunOutcome::Completed { .. }) {
                    if let Err(e) = MetricsAggregator::new(Arc::clone(&store)).compute(run_id).await
                    {
                        tracing::warn!(error = %e, "automatic metrics failed");
                    }
                }
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(error = %err, "run aborted");
                let progress = store.get_run(run_id).await.map_or(0, |r| r.progress);
                if let Err(mark) = store
                    .update_run_status(run_id, RunStatus::Failed, progress, Some(err.to_string()))
                    .await
                {
                    tracing::error!(error = %mark, "could not mark run failed");
                }
                Err(err)
            }
        }
    }

    async fn drive(mut self) -> Result<RunOutcome, EvalError> {
        let mut processed = 0usize;
        let mut failed_items = 0usize;

        while let Some(item) = self.queue.pop_front() {
            if self.token.is_cancelled() || !self.still_running().await? {
                tracing::info!(processed, "run halted before next item");
                return Ok(RunOutcome::Stopped { processed });
            }

            let new_result = match self.process(&item).await {
                ItemStep::Generated(result) => result,
                ItemStep::Cancelled => {
                    tracing::info!(item = %item.id, processed, "in-flight item cancelled");
                    return Ok(RunOutcome::Stopped { processed });
                }
                ItemStep::Failed { error, attempts } => match self.config.failure_policy {
                    FailurePolicy::Record => {
                        tracing::warn!(item = %item.id, attempts, error = %error, "recording failed item");
                        failed_items += 1;
                        NewResult::failure(&item, error.to_string(), attempts)
                    }
                    FailurePolicy::Abort => {
                        let message = format!("item {} failed: {error}", item.id);
                        return self.abort(message).await;
                    }
                },
            };

            match self
                .store
                .append_result(self.run_id, new_result, self.total)
                .await
            {
                Ok(_) => processed += 1,
                Err(StoreError::Conflict(_)) => {
                    tracing::info!(processed, "run left running while item was in flight");
                    return Ok(RunOutcome::Stopped { processed });
                }
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(item = %item.id, processed, total = self.total, "item done");

            self.pause().await;
        }

        match self
            .store
            .update_run_status(self.run_id, RunStatus::Completed, 100, None)
            .await
        {
            Ok(_) => {
                tracing::info!(results = processed, failed_items, "run completed");
                Ok(RunOutcome::Completed {
                    results: processed,
                    failed_items,
                })
            }
            Err(StoreError::InvalidTransition { .. }) => Ok(RunOutcome::Stopped { processed }),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read the persisted status
    async fn still_running(&self) -> Result<bool, EvalError> {
        let run = self
            .store
            .get_run(self.run_id)
            .await
            .map_err(|e| EvalError::for_run(self.run_id, e))?;
        Ok(run.status == RunStatus::Running)
    }

    /// Generate one item with timeout, bounded retries and cancellation
    async fn process(&self, item: &DatasetItem) -> ItemStep {
        let request = GenerationRequest {
            input: item.input.clone(),
            provider_id: self.provider_id.clone(),
            model_id: self.model_id.clone(),
        };
        let timeout = self.config.item_timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let call = tokio::time::timeout(timeout, self.generator.generate(&request));

            let outcome = tokio::select! {
                biased;
                () = self.token.cancelled() => return ItemStep::Cancelled,
                res = call => res.unwrap_or(Err(GenerationError::Timeout {
                    timeout_ms: self.config.item_timeout_ms,
                })),
            };

            match outcome {
                Ok(generation) => {
                    let mut result = NewResult::success(item, generation);
                    if attempt > 1 {
                        result.metadata = Some(
                            [("attempts".to_string(), serde_json::Value::from(attempt))]
                                .into_iter()
                                .collect(),
                        );
                    }
                    return ItemStep::Generated(result);
                }
                Err(error) if error.is_retryable() && attempt <= self.config.max_retries => {
                    tracing::warn!(item = %item.id, attempt, error = %error, "retrying item");
                    tokio::select! {
                        biased;
                        () = self.token.cancelled() => return ItemStep::Cancelled,
                        () = tokio::time::sleep(self.config.backoff(attempt)) => {}
                    }
                }
                Err(error) => return ItemStep::Failed { error, attempts: attempt },
            }
        }
    }

    /// Fail the run under the abort policy
    async fn abort(&self, message: String) -> Result<RunOutcome, EvalError> {
        let progress = self.store.get_run(self.run_id).await?.progress;
        match self
            .store
            .update_run_status(self.run_id, RunStatus::Failed, progress, Some(message.clone()))
            .await
        {
            Ok(_) => {
                tracing::warn!(error = %message, "run aborted by failed item");
                Ok(RunOutcome::Failed { error: message })
            }
            Err(StoreError::InvalidTransition { .. }) => Ok(RunOutcome::Stopped {
                processed: self.total - self.queue.len() - 1,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Yield between items so readers observe incremental progress
    async fn pause(&self) {
        let delay = self.config.item_delay();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
