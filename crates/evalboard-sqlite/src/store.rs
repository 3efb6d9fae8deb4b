//! SQLite-backed run and dataset store
//!
//! One connection behind a mutex; every trait call runs on the blocking pool.
//! Writes that touch more than one row (status validation, result append with
//! progress, dataset creation) run in a single `IMMEDIATE` transaction.

use crate::error::SqliteError;
use crate::rows::{
    create_tables, from_nanos, item_from_row, result_from_row, run_from_row, to_count, to_json,
    to_nanos, RESULT_COLUMNS, RUN_COLUMNS,
};
use async_trait::async_trait;
use evalboard_core::store::{apply_status, DatasetSource, DatasetStore, RunStore};
use evalboard_core::types::running_progress;
use evalboard_core::{
    Dataset, DatasetId, DatasetItem, InferenceResult, InferenceRun, MetricsMap, NewDataset,
    NewResult, NewRun, ResultId, RunFilter, RunId, RunStatus, StoreError,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;

/// Persistent [`RunStore`] and [`DatasetStore`]
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        tracing::info!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, SqliteError> {
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, SqliteError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| SqliteError::Join(e.to_string()))?
        .map_err(StoreError::from)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn load_run(conn: &Connection, id: RunId) -> Result<InferenceRun, SqliteError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id.to_string()])?;
    let run = match rows.next()? {
        Some(row) => run_from_row(row)?,
        None => return Err(StoreError::run_not_found(id).into()),
    };
    Ok(run)
}

fn ensure_run(conn: &Connection, id: RunId) -> Result<(), SqliteError> {
    conn.query_row(
        "SELECT 1 FROM runs WHERE id = ?1",
        params![id.to_string()],
        |_| Ok(()),
    )
    .optional()?
    .ok_or_else(|| StoreError::run_not_found(id).into())
}

fn write_run(conn: &Connection, run: &InferenceRun) -> Result<(), SqliteError> {
    conn.execute(
        "UPDATE runs SET status = ?1, progress = ?2, metrics = ?3, error = ?4, \
         updated_at = ?5, completed_at = ?6 WHERE id = ?7",
        params![
            run.status.as_str(),
            i64::from(run.progress),
            to_json(run.metrics.as_ref())?,
            run.error,
            to_nanos(run.updated_at),
            run.completed_at.map(to_nanos),
            run.id.to_string(),
        ],
    )?;
    Ok(())
}

fn load_items(conn: &Connection, id: &DatasetId) -> Result<Vec<DatasetItem>, SqliteError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, input, expected_output FROM dataset_items \
         WHERE dataset_id = ?1 ORDER BY position",
    )?;
    let mut rows = stmt.query(params![id.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(item_from_row(row)?);
    }
    Ok(items)
}

fn load_dataset(conn: &Connection, id: &DatasetId) -> Result<Dataset, SqliteError> {
    let header = conn
        .query_row(
            "SELECT name, description, created_at FROM datasets WHERE id = ?1",
            params![id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((name, description, created_at)) = header else {
        return Err(StoreError::dataset_not_found(id).into());
    };

    Ok(Dataset {
        id: id.clone(),
        name,
        description,
        created_at: from_nanos(created_at),
        items: load_items(conn, id)?,
    })
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, new: NewRun) -> Result<InferenceRun, StoreError> {
        let run = InferenceRun::from_new(new);
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO runs ({RUN_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    run.id.to_string(),
                    run.name,
                    run.description,
                    run.dataset_id.as_str(),
                    run.provider_id.as_str(),
                    run.model_id.as_str(),
                    run.status.as_str(),
                    i64::from(run.progress),
                    to_json(run.metrics.as_ref())?,
                    run.error,
                    to_nanos(run.created_at),
                    to_nanos(run.updated_at),
                    run.completed_at.map(to_nanos),
                ],
            )?;
            Ok(run)
        })
        .await
    }

    async fn get_run(&self, id: RunId) -> Result<InferenceRun, StoreError> {
        self.call(move |conn| load_run(conn, id)).await
    }

    async fn update_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        progress: u8,
        error: Option<String>,
    ) -> Result<InferenceRun, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut run = load_run(&tx, id)?;
            apply_status(&mut run, status, progress, error)?;
            write_run(&tx, &run)?;
            if status == RunStatus::Running {
                tx.execute(
                    "DELETE FROM results WHERE run_id = ?1",
                    params![id.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(run)
        })
        .await
    }

    async fn delete_results(&self, run_id: RunId) -> Result<(), StoreError> {
        self.call(move |conn| {
            ensure_run(conn, run_id)?;
            conn.execute(
                "DELETE FROM results WHERE run_id = ?1",
                params![run_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_result(
        &self,
        run_id: RunId,
        result: NewResult,
        total_items: usize,
    ) -> Result<InferenceResult, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut run = load_run(&tx, run_id)?;
            if run.status != RunStatus::Running {
                return Err(StoreError::Conflict(format!(
                    "run {run_id} is {}, not running",
                    run.status
                ))
                .into());
            }

            let result = InferenceResult::from_new(run_id, result);
            tx.execute(
                &format!(
                    "INSERT INTO results ({RESULT_COLUMNS}, seq) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM results WHERE run_id = ?2))"
                ),
                params![
                    result.id.to_string(),
                    run_id.to_string(),
                    result.dataset_item_id.as_str(),
                    result.input,
                    result.expected_output,
                    result.actual_output,
                    to_json(result.metrics.as_ref())?,
                    to_json(result.metadata.as_ref())?,
                    result.error,
                    result.latency_ms.map(to_count),
                    result.token_count.map(to_count),
                    to_nanos(result.created_at),
                ],
            )?;

            let done: i64 = tx.query_row(
                "SELECT COUNT(*) FROM results WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )?;
            let done = usize::try_from(done).unwrap_or(0);
            run.progress = run.progress.max(running_progress(done, total_items));
            run.updated_at = chrono::Utc::now();
            write_run(&tx, &run)?;

            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn set_run_metrics(&self, run_id: RunId, metrics: MetricsMap) -> Result<(), StoreError> {
        self.call(move |conn| {
            let rows = conn.execute(
                "UPDATE runs SET metrics = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    to_json(Some(&metrics))?,
                    to_nanos(chrono::Utc::now()),
                    run_id.to_string()
                ],
            )?;
            if rows == 0 {
                return Err(StoreError::run_not_found(run_id).into());
            }
            Ok(())
        })
        .await
    }

    async fn set_result_metrics(
        &self,
        result_id: ResultId,
        metrics: MetricsMap,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let rows = conn.execute(
                "UPDATE results SET metrics = ?1 WHERE id = ?2",
                params![to_json(Some(&metrics))?, result_id.to_string()],
            )?;
            if rows == 0 {
                return Err(StoreError::result_not_found(result_id).into());
            }
            Ok(())
        })
        .await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<InferenceRun>, StoreError> {
        let filter = filter.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RUN_COLUMNS} FROM runs \
                 WHERE (?1 IS NULL OR dataset_id = ?1) \
                   AND (?2 IS NULL OR provider_id = ?2) \
                   AND (?3 IS NULL OR model_id = ?3) \
                   AND (?4 IS NULL OR status = ?4) \
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query(params![
                filter.dataset_id.as_ref().map(|d| d.as_str()),
                filter.provider_id.as_ref().map(|p| p.as_str()),
                filter.model_id.as_ref().map(|m| m.as_str()),
                filter.status.map(RunStatus::as_str),
            ])?;
            let mut runs = Vec::new();
            while let Some(row) = rows.next()? {
                runs.push(run_from_row(row)?);
            }
            Ok(runs)
        })
        .await
    }

    async fn list_results(&self, run_id: RunId) -> Result<Vec<InferenceResult>, StoreError> {
        self.call(move |conn| {
            ensure_run(conn, run_id)?;
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RESULT_COLUMNS} FROM results WHERE run_id = ?1 ORDER BY seq"
            ))?;
            let mut rows = stmt.query(params![run_id.to_string()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(result_from_row(row)?);
            }
            Ok(results)
        })
        .await
    }

    async fn delete_run(&self, id: RunId) -> Result<(), StoreError> {
        self.call(move |conn| {
            let rows = conn.execute("DELETE FROM runs WHERE id = ?1", params![id.to_string()])?;
            if rows == 0 {
                return Err(StoreError::run_not_found(id).into());
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DatasetSource for SqliteStore {
    async fn list_items(&self, dataset_id: &DatasetId) -> Result<Vec<DatasetItem>, StoreError> {
        let id = dataset_id.clone();
        self.call(move |conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM datasets WHERE id = ?1",
                    params![id.as_str()],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::dataset_not_found(&id).into());
            }
            load_items(conn, &id)
        })
        .await
    }
}

#[async_trait]
impl DatasetStore for SqliteStore {
    async fn create_dataset(&self, new: NewDataset) -> Result<Dataset, StoreError> {
        let dataset = Dataset::from_new(new);
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO datasets (id, name, description, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    dataset.id.as_str(),
                    dataset.name,
                    dataset.description,
                    to_nanos(dataset.created_at),
                ],
            )?;
            if inserted == 0 {
                return Err(
                    StoreError::Conflict(format!("dataset {} already exists", dataset.id)).into(),
                );
            }
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO dataset_items (dataset_id, position, id, input, expected_output) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (position, item) in dataset.items.iter().enumerate() {
                    stmt.execute(params![
                        dataset.id.as_str(),
                        i64::try_from(position).unwrap_or(i64::MAX),
                        item.id.as_str(),
                        item.input,
                        item.expected_output,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(dataset)
        })
        .await
    }

    async fn get_dataset(&self, id: &DatasetId) -> Result<Dataset, StoreError> {
        let id = id.clone();
        self.call(move |conn| load_dataset(conn, &id)).await
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        self.call(|conn| {
            let ids: Vec<String> = {
                let mut stmt =
                    conn.prepare_cached("SELECT id FROM datasets ORDER BY created_at DESC, id DESC")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                ids
            };
            ids.into_iter()
                .map(|id| load_dataset(conn, &DatasetId::new(id)))
                .collect()
        })
        .await
    }

    async fn delete_dataset(&self, id: &DatasetId) -> Result<(), StoreError> {
        let id = id.clone();
        self.call(move |conn| {
            let rows = conn.execute("DELETE FROM datasets WHERE id = ?1", params![id.as_str()])?;
            if rows == 0 {
                return Err(StoreError::dataset_not_found(&id).into());
            }
            Ok(())
        })
        .await
    }
}
