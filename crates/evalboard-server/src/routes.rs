//! REST API
//!
//! | Method | Path                   | Reply                        |
//! |--------|------------------------|------------------------------|
//! | GET    | `/health`              | `{status}`                   |
//! | POST   | `/runs`                | 201 run                      |
//! | GET    | `/runs`                | runs, newest first           |
//! | GET    | `/runs/{id}`           | run                          |
//! | DELETE | `/runs/{id}`           | 204                          |
//! | POST   | `/runs/{id}/run`       | 202 `{started}`              |
//! | POST   | `/runs/{id}/stop`      | `{stopped}`                  |
//! | GET    | `/runs/{id}/results`   | results, in dataset order    |
//! | POST   | `/runs/{id}/metrics`   | `{metrics}`                  |
//! | GET    | `/leaderboard?metric=` | ranked entries               |
//! | POST   | `/datasets`            | 201 dataset                  |
//! | GET    | `/datasets`            | datasets                     |
//! | GET    | `/datasets/{id}`       | dataset with items           |
//! | DELETE | `/datasets/{id}`       | 204                          |
//!
//! Errors are `{"error": "..."}` with 400, 404, 409, 422 or 500.

use crate::app::AppState;
use evalboard_core::{
    DatasetId, EvalError, ModelId, NewDataset, NewRun, ProviderId, RunFilter, RunId, RunStatus,
    StopOutcome, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Largest accepted JSON body
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Request failure carried through warp's rejection system
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl warp::reject::Reject for ApiError {}

impl From<EvalError> for ApiError {
    fn from(err: EvalError) -> Self {
        let status = match &err {
            EvalError::RunNotFound(_) | EvalError::DatasetNotFound(_) => StatusCode::NOT_FOUND,
            EvalError::EmptyDataset(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EvalError::InvalidTransition { .. } => StatusCode::CONFLICT,
            EvalError::Store(store) => return store_status(store, err.to_string()),
            EvalError::Config(_) => StatusCode::BAD_REQUEST,
            EvalError::Generation(_) | EvalError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        store_status(&err, message)
    }
}

fn store_status(err: &StoreError, message: String) -> ApiError {
    let status = match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidTransition { .. } | StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Backend(_) | StoreError::Serialization(_) => {
            tracing::error!(error = %message, "store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    ApiError::new(status, message)
}

fn reject(err: impl Into<ApiError>) -> Rejection {
    warp::reject::custom(err.into())
}

fn parse_run_id(raw: &str) -> Result<RunId, Rejection> {
    raw.parse()
        .map_err(|_| reject(ApiError::bad_request(format!("invalid run id: {raw}"))))
}

/// `GET /runs` query string
#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    dataset_id: Option<String>,
    provider_id: Option<String>,
    model_id: Option<String>,
    status: Option<String>,
}

impl RunQuery {
    fn into_filter(self) -> Result<RunFilter, ApiError> {
        let status = self
            .status
            .map(|s| s.parse::<RunStatus>())
            .transpose()
            .map_err(ApiError::bad_request)?;
        Ok(RunFilter {
            dataset_id: self.dataset_id.map(DatasetId::from),
            provider_id: self.provider_id.map(ProviderId::from),
            model_id: self.model_id.map(ModelId::from),
            status,
        })
    }
}

/// `GET /leaderboard` query string
#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    metric: String,
    dataset_id: Option<String>,
    provider_id: Option<String>,
    model_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartReply {
    started: bool,
}

#[derive(Debug, Serialize)]
struct StopReply {
    stopped: bool,
}

/// Every route, with rejections rendered as JSON errors
pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "status": "ok" })));

    let create_run = warp::path!("runs")
        .and(warp::post())
        .and(json_body::<NewRun>())
        .and(with_state(state.clone()))
        .and_then(handlers::create_run);

    let list_runs = warp::path!("runs")
        .and(warp::get())
        .and(warp::query::<RunQuery>())
        .and(with_state(state.clone()))
        .and_then(handlers::list_runs);

    let get_run = warp::path!("runs" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::get_run);

    let delete_run = warp::path!("runs" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(handlers::delete_run);

    let start_run = warp::path!("runs" / String / "run")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(handlers::start_run);

    let stop_run = warp::path!("runs" / String / "stop")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(handlers::stop_run);

    let results = warp::path!("runs" / String / "results")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::list_results);

    let metrics = warp::path!("runs" / String / "metrics")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(handlers::compute_metrics);

    let leaderboard = warp::path!("leaderboard")
        .and(warp::get())
        .and(warp::query::<LeaderboardQuery>())
        .and(with_state(state.clone()))
        .and_then(handlers::leaderboard);

    let create_dataset = warp::path!("datasets")
        .and(warp::post())
        .and(json_body::<NewDataset>())
        .and(with_state(state.clone()))
        .and_then(handlers::create_dataset);

    let list_datasets = warp::path!("datasets")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::list_datasets);

    let get_dataset = warp::path!("datasets" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::get_dataset);

    let delete_dataset = warp::path!("datasets" / String)
        .and(warp::delete())
        .and(with_state(state))
        .and_then(handlers::delete_dataset);

    let runs = create_run
        .or(list_runs)
        .or(get_run)
        .or(delete_run)
        .or(start_run)
        .or(stop_run)
        .or(results)
        .or(metrics)
        .boxed();

    let datasets = create_dataset
        .or(list_datasets)
        .or(get_dataset)
        .or(delete_dataset)
        .boxed();

    health
        .or(runs)
        .or(leaderboard)
        .or(datasets)
        .recover(handle_rejection)
        .with(warp::trace::request())
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

mod handlers {
    use super::{parse_run_id, reject, ApiError, LeaderboardQuery, RunQuery, StartReply, StopReply};
    use crate::app::AppState;
    use evalboard_core::{DatasetId, EvalError, NewDataset, NewRun, RunFilter, RunStatus};
    use warp::http::StatusCode;
    use warp::{Rejection, Reply};

    pub(super) async fn create_run(new: NewRun, state: AppState) -> Result<impl Reply, Rejection> {
        if new.name.trim().is_empty() {
            return Err(reject(ApiError::bad_request("run name must not be empty")));
        }
        let run = state.runs.create_run(new).await.map_err(reject)?;
        tracing::info!(run_id = %run.id, dataset = %run.dataset_id, model = %run.model_id, "run created");
        Ok(warp::reply::with_status(
            warp::reply::json(&run),
            StatusCode::CREATED,
        ))
    }

    pub(super) async fn list_runs(query: RunQuery, state: AppState) -> Result<impl Reply, Rejection> {
        let filter = query.into_filter().map_err(reject)?;
        let runs = state.runs.list_runs(&filter).await.map_err(reject)?;
        Ok(warp::reply::json(&runs))
    }

    pub(super) async fn get_run(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        let id = parse_run_id(&id)?;
        let run = state
            .runs
            .get_run(id)
            .await
            .map_err(|e| reject(EvalError::for_run(id, e)))?;
        Ok(warp::reply::json(&run))
    }

    pub(super) async fn delete_run(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        let id = parse_run_id(&id)?;
        let run = state
            .runs
            .get_run(id)
            .await
            .map_err(|e| reject(EvalError::for_run(id, e)))?;
        if run.status == RunStatus::Running {
            return Err(reject(ApiError::new(
                StatusCode::CONFLICT,
                format!("run {id} is running; stop it first"),
            )));
        }
        state
            .runs
            .delete_run(id)
            .await
            .map_err(|e| reject(EvalError::for_run(id, e)))?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(super) async fn start_run(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        let id = parse_run_id(&id)?;
        let outcome = state.executor.start(id).await.map_err(|e| match e {
            EvalError::DatasetNotFound(_) => reject(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                e.to_string(),
            )),
            other => reject(other),
        })?;
        // The worker runs detached; clients poll the run for progress
        let started = outcome.started();
        Ok(warp::reply::with_status(
            warp::reply::json(&StartReply { started }),
            StatusCode::ACCEPTED,
        ))
    }

    pub(super) async fn stop_run(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        let id = parse_run_id(&id)?;
        let outcome = state.executor.stop(id).await.map_err(reject)?;
        Ok(warp::reply::json(&StopReply {
            stopped: outcome == super::StopOutcome::Stopped,
        }))
    }

    pub(super) async fn list_results(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        let id = parse_run_id(&id)?;
        let results = state
            .runs
            .list_results(id)
            .await
            .map_err(|e| reject(EvalError::for_run(id, e)))?;
        Ok(warp::reply::json(&results))
    }

    pub(super) async fn compute_metrics(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        let id = parse_run_id(&id)?;
        let metrics = state.aggregator.compute(id).await.map_err(reject)?;
        Ok(warp::reply::json(&serde_json::json!({ "metrics": metrics })))
    }

    pub(super) async fn leaderboard(
        query: LeaderboardQuery,
        state: AppState,
    ) -> Result<impl Reply, Rejection> {
        let filter = RunFilter {
            dataset_id: query.dataset_id.map(Into::into),
            provider_id: query.provider_id.map(Into::into),
            model_id: query.model_id.map(Into::into),
            status: None,
        };
        let entries = state
            .leaderboard
            .rank(&query.metric, &filter)
            .await
            .map_err(reject)?;
        Ok(warp::reply::json(&entries))
    }

    pub(super) async fn create_dataset(
        new: NewDataset,
        state: AppState,
    ) -> Result<impl Reply, Rejection> {
        if new.name.trim().is_empty() {
            return Err(reject(ApiError::bad_request("dataset name must not be empty")));
        }
        let dataset = state.datasets.create_dataset(new).await.map_err(reject)?;
        tracing::info!(dataset = %dataset.id, items = dataset.items.len(), "dataset created");
        Ok(warp::reply::with_status(
            warp::reply::json(&dataset),
            StatusCode::CREATED,
        ))
    }

    pub(super) async fn list_datasets(state: AppState) -> Result<impl Reply, Rejection> {
        let datasets = state.datasets.list_datasets().await.map_err(reject)?;
        Ok(warp::reply::json(&datasets))
    }

    pub(super) async fn get_dataset(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        let dataset = state
            .datasets
            .get_dataset(&DatasetId::new(id))
            .await
            .map_err(reject)?;
        Ok(warp::reply::json(&dataset))
    }

    pub(super) async fn delete_dataset(id: String, state: AppState) -> Result<impl Reply, Rejection> {
        state
            .datasets
            .delete_dataset(&DatasetId::new(id))
            .await
            .map_err(reject)?;
        Ok(StatusCode::NO_CONTENT)
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(api) = err.find::<ApiError>() {
        (api.status, api.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "no such route".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "content-length required".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "request body too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        tracing::error!(rejection = ?err, "unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_errors_map_to_status() {
        let cases = [
            (EvalError::RunNotFound(RunId::new()), StatusCode::NOT_FOUND),
            (
                EvalError::EmptyDataset(DatasetId::new("qa")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                EvalError::InvalidTransition {
                    from: RunStatus::Pending,
                    to: RunStatus::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (
                EvalError::Store(StoreError::Backend("disk full".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                EvalError::Store(StoreError::dataset_not_found("qa")),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn run_query_rejects_unknown_status() {
        let query = RunQuery {
            status: Some("paused".into()),
            ..RunQuery::default()
        };
        let err = query.into_filter().unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
