//! Schema and row codecs
//!
//! Timestamps are stored as nanoseconds since the epoch so that ordering by
//! column matches ordering by time. Metric and metadata maps are JSON text.

use crate::error::SqliteError;
use chrono::{DateTime, TimeZone, Utc};
use evalboard_core::{
    DatasetItem, InferenceResult, InferenceRun, ItemId, Metadata, MetricsMap, ResultId, RunId,
    RunStatus,
};
use rusqlite::{Connection, Row};
use std::str::FromStr;

pub(crate) fn create_tables(conn: &Connection) -> Result<(), SqliteError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS runs (\
            id TEXT PRIMARY KEY,\
            name TEXT NOT NULL,\
            description TEXT,\
            dataset_id TEXT NOT NULL,\
            provider_id TEXT NOT NULL,\
            model_id TEXT NOT NULL,\
            status TEXT NOT NULL,\
            progress INTEGER NOT NULL DEFAULT 0,\
            metrics TEXT,\
            error TEXT,\
            created_at INTEGER NOT NULL,\
            updated_at INTEGER NOT NULL,\
            completed_at INTEGER\
         );\
         CREATE TABLE IF NOT EXISTS results (\
            id TEXT PRIMARY KEY,\
            run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,\
            seq INTEGER NOT NULL,\
            dataset_item_id TEXT NOT NULL,\
            input TEXT NOT NULL,\
            expected_output TEXT,\
            actual_output TEXT NOT NULL,\
            metrics TEXT,\
            metadata TEXT,\
            error TEXT,\
            latency_ms INTEGER,\
            token_count INTEGER,\
            created_at INTEGER NOT NULL\
         );\
         CREATE TABLE IF NOT EXISTS datasets (\
            id TEXT PRIMARY KEY,\
            name TEXT NOT NULL,\
            description TEXT,\
            created_at INTEGER NOT NULL\
         );\
         CREATE TABLE IF NOT EXISTS dataset_items (\
            dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,\
            position INTEGER NOT NULL,\
            id TEXT NOT NULL,\
            input TEXT NOT NULL,\
            expected_output TEXT,\
            PRIMARY KEY (dataset_id, position)\
         );\
         CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC, id DESC);\
         CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);\
         CREATE INDEX IF NOT EXISTS idx_results_run ON results(run_id, seq);",
    )?;
    Ok(())
}

pub(crate) const RUN_COLUMNS: &str = "id, name, description, dataset_id, provider_id, model_id, \
     status, progress, metrics, error, created_at, updated_at, completed_at";

pub(crate) const RESULT_COLUMNS: &str = "id, run_id, dataset_item_id, input, expected_output, \
     actual_output, metrics, metadata, error, latency_ms, token_count, created_at";

pub(crate) fn run_from_row(row: &Row<'_>) -> Result<InferenceRun, SqliteError> {
    let progress: i64 = row.get(7)?;
    Ok(InferenceRun {
        id: RunId::from_str(&row.get::<_, String>(0)?).map_err(decode)?,
        name: row.get(1)?,
        description: row.get(2)?,
        dataset_id: row.get::<_, String>(3)?.into(),
        provider_id: row.get::<_, String>(4)?.into(),
        model_id: row.get::<_, String>(5)?.into(),
        status: RunStatus::from_str(&row.get::<_, String>(6)?).map_err(SqliteError::Decode)?,
        progress: u8::try_from(progress).map_err(decode)?,
        metrics: from_json(row.get(8)?)?,
        error: row.get(9)?,
        created_at: from_nanos(row.get(10)?),
        updated_at: from_nanos(row.get(11)?),
        completed_at: row.get::<_, Option<i64>>(12)?.map(from_nanos),
    })
}

pub(crate) fn result_from_row(row: &Row<'_>) -> Result<InferenceResult, SqliteError> {
    Ok(InferenceResult {
        id: ResultId::from_str(&row.get::<_, String>(0)?).map_err(decode)?,
        run_id: RunId::from_str(&row.get::<_, String>(1)?).map_err(decode)?,
        dataset_item_id: ItemId::new(row.get::<_, String>(2)?),
        input: row.get(3)?,
        expected_output: row.get(4)?,
        actual_output: row.get(5)?,
        metrics: from_json::<MetricsMap>(row.get(6)?)?,
        metadata: from_json::<Metadata>(row.get(7)?)?,
        error: row.get(8)?,
        latency_ms: row.get::<_, Option<i64>>(9)?.map(from_count),
        token_count: row.get::<_, Option<i64>>(10)?.map(from_count),
        created_at: from_nanos(row.get(11)?),
    })
}

pub(crate) fn item_from_row(row: &Row<'_>) -> Result<DatasetItem, SqliteError> {
    Ok(DatasetItem {
        id: ItemId::new(row.get::<_, String>(0)?),
        input: row.get(1)?,
        expected_output: row.get(2)?,
    })
}

pub(crate) fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, SqliteError> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, SqliteError> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Into::into)
}

pub(crate) fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub(crate) fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

pub(crate) fn to_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn decode(err: impl std::fmt::Display) -> SqliteError {
    SqliteError::Decode(err.to_string())
}
