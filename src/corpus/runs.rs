//! Append-only log of pipeline runs. The latest run defines the watermark for
//! the next incremental sync.

use crate::corpus::models::{format_timestamp, parse_timestamp};
use crate::error::{DbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Incremental => "incremental",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "full" => RunMode::Full,
            _ => RunMode::Incremental,
        }
    }
}

/// Metadata of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_at: DateTime<Utc>,
    /// Lower bound used for the upstream `updatedAt` filter.
    pub watermark: DateTime<Utc>,
    pub months_back: i64,
    pub events_processed: u64,
    pub chunks_created: u64,
    pub region: Option<String>,
    pub embedding_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub mode: RunMode,
}

/// Months between `watermark` and `run_at`: days / 30, rounded, never negative.
pub fn months_back(run_at: DateTime<Utc>, watermark: DateTime<Utc>) -> i64 {
    let days = (run_at - watermark).num_days();
    ((days as f64 / 30.0).round() as i64).max(0)
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_at: String,
    watermark: String,
    months_back: i64,
    events_processed: i64,
    chunks_created: i64,
    region: Option<String>,
    embedding_model: String,
    chunk_size: i64,
    chunk_overlap: i64,
    mode: String,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord> {
        let corrupt = |field: &str, raw: &str| {
            DbError::Sqlite(sqlx::Error::Decode(
                format!("pipeline_runs.{field} holds invalid timestamp '{raw}'").into(),
            ))
        };
        Ok(RunRecord {
            run_at: parse_timestamp(&self.run_at).ok_or_else(|| corrupt("run_at", &self.run_at))?,
            watermark: parse_timestamp(&self.watermark)
                .ok_or_else(|| corrupt("watermark", &self.watermark))?,
            months_back: self.months_back,
            events_processed: self.events_processed.max(0) as u64,
            chunks_created: self.chunks_created.max(0) as u64,
            region: self.region,
            embedding_model: self.embedding_model,
            chunk_size: self.chunk_size.max(0) as usize,
            chunk_overlap: self.chunk_overlap.max(0) as usize,
            mode: RunMode::parse(&self.mode),
        })
    }
}

/// SQLite-backed run log.
#[derive(Debug, Clone)]
pub struct RunLog {
    pool: SqlitePool,
}

impl RunLog {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pipeline_runs (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                run_at TEXT NOT NULL, \
                watermark TEXT NOT NULL, \
                months_back INTEGER NOT NULL, \
                events_processed INTEGER NOT NULL, \
                chunks_created INTEGER NOT NULL, \
                region TEXT, \
                embedding_model TEXT NOT NULL, \
                chunk_size INTEGER NOT NULL, \
                chunk_overlap INTEGER NOT NULL, \
                mode TEXT NOT NULL)",
        )
        .execute(&pool)
        .await
        .map_err(DbError::from)?;

        Ok(Self { pool })
    }

    /// Append a run.
    pub async fn record_run(&self, record: &RunRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_runs (run_at, watermark, months_back, events_processed, \
             chunks_created, region, embedding_model, chunk_size, chunk_overlap, mode) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(format_timestamp(record.run_at))
        .bind(format_timestamp(record.watermark))
        .bind(record.months_back)
        .bind(record.events_processed as i64)
        .bind(record.chunks_created as i64)
        .bind(&record.region)
        .bind(&record.embedding_model)
        .bind(record.chunk_size as i64)
        .bind(record.chunk_overlap as i64)
        .bind(record.mode.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        tracing::debug!(
            run_at = %record.run_at,
            events = record.events_processed,
            chunks = record.chunks_created,
            "pipeline run recorded"
        );
        Ok(())
    }

    /// Most recent run by run timestamp, if any.
    pub async fn latest_run(&self) -> Result<Option<RunRecord>> {
        Ok(self.history(1).await?.into_iter().next())
    }

    /// Up to `limit` runs, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT run_at, watermark, months_back, events_processed, chunks_created, region, \
             embedding_model, chunk_size, chunk_overlap, mode \
             FROM pipeline_runs ORDER BY run_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(RunRow::into_record).collect()
    }
}
