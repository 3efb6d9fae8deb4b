//! Core types for evalboard
//!
//! Defines the entities the executor works on:
//! - Run and result identifiers
//! - Inference runs and their status
//! - Inference results
//! - Datasets and dataset items
//! - Generation requests and responses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use ulid::Ulid;

/// Metric name to numeric value
pub type MetricsMap = BTreeMap<String, f64>;

/// Free-form metadata attached to a result
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Unique run identifier (ULID, so ids sort by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Unique result identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(pub Ulid);

impl ResultId {
    /// Generate new result ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ResultId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ResultId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResultId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Declares a string-backed reference to an entity owned elsewhere.
macro_rules! string_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from any string-like value
            #[inline]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow as `&str`
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_ref!(
    /// Dataset reference
    DatasetId
);
string_ref!(
    /// Provider reference (matches a configured provider id)
    ProviderId
);
string_ref!(
    /// Model reference, passed through to the provider
    ModelId
);
string_ref!(
    /// Dataset item reference
    ItemId
);

/// Lifecycle status of an inference run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, never started
    Pending,
    /// Worker is processing items
    Running,
    /// All items processed
    Completed,
    /// Failed or stopped; see the run's error
    Failed,
}

impl RunStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [RunStatus; 4] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
    ];

    /// Stable lowercase name, as stored and served
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no worker will touch the run again without a new start
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution of a model against a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRun {
    /// Run identifier
    pub id: RunId,
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Dataset the run reads items from
    pub dataset_id: DatasetId,
    /// Provider that serves the model
    pub provider_id: ProviderId,
    /// Model to query
    pub model_id: ModelId,
    /// Lifecycle status
    pub status: RunStatus,
    /// Percent of items processed (0-100)
    pub progress: u8,
    /// Aggregated metrics, once computed
    pub metrics: Option<MetricsMap>,
    /// Error message for failed runs
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Set iff status is completed
    pub completed_at: Option<DateTime<Utc>>,
}

impl InferenceRun {
    /// Build a fresh pending run from creation fields
    #[must_use]
    pub fn from_new(new: NewRun) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            name: new.name,
            description: new.description,
            dataset_id: new.dataset_id,
            provider_id: new.provider_id,
            model_id: new.model_id,
            status: RunStatus::Pending,
            progress: 0,
            metrics: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Fields supplied when creating a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRun {
    /// Display name
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Dataset reference
    pub dataset_id: DatasetId,
    /// Provider reference
    pub provider_id: ProviderId,
    /// Model reference
    pub model_id: ModelId,
}

impl NewRun {
    /// Create run fields without description
    #[inline]
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        dataset_id: impl Into<DatasetId>,
        provider_id: impl Into<ProviderId>,
        model_id: impl Into<ModelId>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            dataset_id: dataset_id.into(),
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Per-item outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Result identifier
    pub id: ResultId,
    /// Owning run
    pub run_id: RunId,
    /// Source dataset item
    pub dataset_item_id: ItemId,
    /// Prompt sent to the model
    pub input: String,
    /// Reference answer, if the dataset has one
    pub expected_output: Option<String>,
    /// Model output (empty when the item failed)
    pub actual_output: String,
    /// Per-result metrics, attached after the fact
    pub metrics: Option<MetricsMap>,
    /// Free-form metadata
    pub metadata: Option<Metadata>,
    /// Generation error for this item
    pub error: Option<String>,
    /// Generation latency
    pub latency_ms: Option<u64>,
    /// Tokens consumed
    pub token_count: Option<u64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl InferenceResult {
    /// Materialize a result row for `run_id`
    #[must_use]
    pub fn from_new(run_id: RunId, new: NewResult) -> Self {
        Self {
            id: ResultId::new(),
            run_id,
            dataset_item_id: new.dataset_item_id,
            input: new.input,
            expected_output: new.expected_output,
            actual_output: new.actual_output,
            metrics: None,
            metadata: new.metadata,
            error: new.error,
            latency_ms: new.latency_ms,
            token_count: new.token_count,
            created_at: Utc::now(),
        }
    }
}

/// Fields written when appending a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResult {
    /// Source dataset item
    pub dataset_item_id: ItemId,
    /// Prompt sent to the model
    pub input: String,
    /// Reference answer
    pub expected_output: Option<String>,
    /// Model output
    pub actual_output: String,
    /// Generation error
    pub error: Option<String>,
    /// Generation latency
    pub latency_ms: Option<u64>,
    /// Tokens consumed
    pub token_count: Option<u64>,
    /// Free-form metadata
    pub metadata: Option<Metadata>,
}

impl NewResult {
    /// Successful generation for `item`
    #[must_use]
    pub fn success(item: &DatasetItem, generation: Generation) -> Self {
        Self {
            dataset_item_id: item.id.clone(),
            input: item.input.clone(),
            expected_output: item.expected_output.clone(),
            actual_output: generation.output,
            error: None,
            latency_ms: Some(generation.latency_ms),
            token_count: generation.token_count,
            metadata: None,
        }
    }

    /// Terminal generation failure for `item`
    #[must_use]
    pub fn failure(item: &DatasetItem, error: impl Into<String>, attempts: u32) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("attempts".to_string(), serde_json::Value::from(attempts));
        Self {
            dataset_item_id: item.id.clone(),
            input: item.input.clone(),
            expected_output: item.expected_output.clone(),
            actual_output: String::new(),
            error: Some(error.into()),
            latency_ms: None,
            token_count: None,
            metadata: Some(metadata),
        }
    }
}

/// Run listing filter; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    /// Restrict to one dataset
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    /// Restrict to one provider
    #[serde(default)]
    pub provider_id: Option<ProviderId>,
    /// Restrict to one model
    #[serde(default)]
    pub model_id: Option<ModelId>,
    /// Restrict to one status
    #[serde(default)]
    pub status: Option<RunStatus>,
}

impl RunFilter {
    /// Match everything
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// With dataset
    #[inline]
    #[must_use]
    pub fn with_dataset(mut self, dataset_id: impl Into<DatasetId>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    /// With provider
    #[inline]
    #[must_use]
    pub fn with_provider(mut self, provider_id: impl Into<ProviderId>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    /// With model
    #[inline]
    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<ModelId>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// With status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Check a run against every set field
    #[must_use]
    pub fn matches(&self, run: &InferenceRun) -> bool {
        self.dataset_id.as_ref().map_or(true, |d| *d == run.dataset_id)
            && self.provider_id.as_ref().map_or(true, |p| *p == run.provider_id)
            && self.model_id.as_ref().map_or(true, |m| *m == run.model_id)
            && self.status.map_or(true, |s| s == run.status)
    }
}

/// One input/expected-output pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetItem {
    /// Item identifier
    pub id: ItemId,
    /// Prompt text
    pub input: String,
    /// Reference answer
    #[serde(default)]
    pub expected_output: Option<String>,
}

impl DatasetItem {
    /// Create item without reference answer
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<ItemId>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            expected_output: None,
        }
    }

    /// With expected output
    #[inline]
    #[must_use]
    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }
}

/// Item supplied when creating a dataset; the id is generated when absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDatasetItem {
    /// Optional caller-chosen id
    #[serde(default)]
    pub id: Option<ItemId>,
    /// Prompt text
    pub input: String,
    /// Reference answer
    #[serde(default)]
    pub expected_output: Option<String>,
}

impl NewDatasetItem {
    /// Assign an id (generated when absent)
    #[must_use]
    pub fn into_item(self) -> DatasetItem {
        DatasetItem {
            id: self.id.unwrap_or_else(|| ItemId::new(Ulid::new().to_string())),
            input: self.input,
            expected_output: self.expected_output,
        }
    }
}

impl From<DatasetItem> for NewDatasetItem {
    fn from(item: DatasetItem) -> Self {
        Self {
            id: Some(item.id),
            input: item.input,
            expected_output: item.expected_output,
        }
    }
}

/// Fields supplied when creating a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataset {
    /// Optional caller-chosen id
    #[serde(default)]
    pub id: Option<DatasetId>,
    /// Display name
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Items, in order
    #[serde(default)]
    pub items: Vec<NewDatasetItem>,
}

impl NewDataset {
    /// Dataset with a generated id
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            items: Vec::new(),
        }
    }

    /// With fixed id
    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: impl Into<DatasetId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// With items
    #[inline]
    #[must_use]
    pub fn with_items(mut self, items: impl IntoIterator<Item = DatasetItem>) -> Self {
        self.items = items.into_iter().map(NewDatasetItem::from).collect();
        self
    }
}

/// Named, ordered collection of items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset identifier
    pub id: DatasetId,
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Items, in order
    pub items: Vec<DatasetItem>,
}

impl Dataset {
    /// Materialize a dataset, assigning ids where missing
    #[must_use]
    pub fn from_new(new: NewDataset) -> Self {
        Self {
            id: new
                .id
                .unwrap_or_else(|| DatasetId::new(Ulid::new().to_string())),
            name: new.name,
            description: new.description,
            created_at: Utc::now(),
            items: new.items.into_iter().map(NewDatasetItem::into_item).collect(),
        }
    }
}

/// Input to a response generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Prompt text
    pub input: String,
    /// Provider to route to
    pub provider_id: ProviderId,
    /// Model to query
    pub model_id: ModelId,
}

/// Output of a response generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// Model output
    pub output: String,
    /// Wall-clock latency of the call
    pub latency_ms: u64,
    /// Tokens consumed, if the provider reports them
    pub token_count: Option<u64>,
}

/// Progress for `done` of `total` items while a run is still running.
///
/// Capped at 99 so that 100 is reserved for completed runs.
#[inline]
#[must_use]
pub fn running_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (done.min(total) * 100) / total;
    u8::try_from(pct.min(99)).unwrap_or(99)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_generation() {
        let id1 = RunId::new();
        let id2 = RunId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_id_round_trips_through_string() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<RunId>().is_err());
    }

    #[test]
    fn run_status_names() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<RunStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn new_run_starts_pending() {
        let run = InferenceRun::from_new(NewRun::new("r", "ds", "mock", "m1"));
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.progress, 0);
        assert!(run.completed_at.is_none());
        assert!(run.error.is_none());
    }

    #[test]
    fn filter_matches_set_fields_only() {
        let run = InferenceRun::from_new(NewRun::new("r", "ds", "mock", "m1"));

        assert!(RunFilter::all().matches(&run));
        assert!(RunFilter::all().with_dataset("ds").matches(&run));
        assert!(RunFilter::all()
            .with_provider("mock")
            .with_model("m1")
            .with_status(RunStatus::Pending)
            .matches(&run));
        assert!(!RunFilter::all().with_model("m2").matches(&run));
        assert!(!RunFilter::all().with_status(RunStatus::Running).matches(&run));
    }

    #[test]
    fn running_progress_is_floored_and_capped() {
        assert_eq!(running_progress(0, 5), 0);
        assert_eq!(running_progress(1, 3), 33);
        assert_eq!(running_progress(2, 3), 66);
        assert_eq!(running_progress(3, 3), 99);
        assert_eq!(running_progress(4, 0), 0);
    }

    #[test]
    fn dataset_assigns_missing_ids() {
        let mut new = NewDataset::new("qa");
        new.items.push(NewDatasetItem {
            id: None,
            input: "q".into(),
            expected_output: None,
        });
        let ds = Dataset::from_new(new);
        assert!(!ds.id.as_str().is_empty());
        assert!(!ds.items[0].id.as_str().is_empty());
    }

    #[test]
    fn failure_result_records_attempts() {
        let item = DatasetItem::new("i1", "q").with_expected("a");
        let res = NewResult::failure(&item, "boom", 3);
        assert_eq!(res.error.as_deref(), Some("boom"));
        assert_eq!(res.expected_output.as_deref(), Some("a"));
        assert!(res.actual_output.is_empty());
        assert_eq!(res.metadata.unwrap()["attempts"], serde_json::json!(3));
    }
}
