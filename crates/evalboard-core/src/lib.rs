//! evalboard core - LLM evaluation run lifecycle
//!
//! Provides:
//! - Inference runs driven through `pending → running → {completed, failed}`
//! - Per-run workers with timeouts, retries and cooperative stop
//! - Store, dataset and generator contracts with in-memory implementations
//! - Metrics aggregation and a leaderboard over completed runs
//!
//! # Example
//!
//! ```rust,ignore
//! use evalboard_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let executor = RunExecutor::new(store.clone(), store.clone(), Arc::new(MockGenerator::default()));
//!
//! let run = store.create_run(NewRun::new("baseline", "qa", "mock", "gpt-4o")).await?;
//! if let Some(handle) = executor.start(run.id).await?.into_handle() {
//!     handle.wait().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod generator;
pub mod leaderboard;
pub mod memory;
pub mod metrics;
pub mod state;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use config::{ExecutorConfig, FailurePolicy};
pub use error::{EvalError, GenerationError, StoreError};
pub use executor::{
    RunExecutor, RunHandle, RunOutcome, StartOutcome, StopOutcome, INTERRUPTED_MESSAGE,
    STOPPED_MESSAGE,
};
pub use generator::{MockGenerator, ResponseGenerator};
pub use leaderboard::{Direction, Leaderboard, LeaderboardEntry};
pub use memory::InMemoryStore;
pub use metrics::MetricsAggregator;
pub use store::{DatasetSource, DatasetStore, RunStore};
pub use types::{
    Dataset, DatasetId, DatasetItem, Generation, GenerationRequest, InferenceResult, InferenceRun,
    ItemId, Metadata, MetricsMap, ModelId, NewDataset, NewDatasetItem, NewResult, NewRun,
    ProviderId, ResultId, RunFilter, RunId, RunStatus,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with evalboard core
    pub use crate::{
        DatasetStore, EvalError, ExecutorConfig, InMemoryStore, MetricsAggregator, MockGenerator,
        NewDataset, NewRun, ResponseGenerator, RunExecutor, RunFilter, RunId, RunStatus, RunStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
