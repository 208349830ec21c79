//! Document store: named collections of JSON documents.

use crate::corpus::models::{format_timestamp, parse_timestamp};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;

/// A stored document. `doc_id` increases with insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub doc_id: i64,
    pub uid: String,
    /// Owning record key; empty for top-level records.
    pub parent_uid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub body: Value,
}

/// A document to upsert, keyed by `(uid, parent_uid)` within a collection.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub uid: String,
    pub parent_uid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Backend operations the pipeline needs. A collection exists while it holds
/// at least one document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert, or replace the body of the document with the same key.
    async fn upsert(&self, collection: &str, document: NewDocument) -> Result<UpsertOutcome>;

    /// All documents of a collection in insertion order.
    async fn find(&self, collection: &str) -> Result<Vec<Document>>;

    async fn count(&self, collection: &str) -> Result<u64>;

    /// Documents whose `updated_at` is at or after `since`.
    async fn count_updated_since(&self, collection: &str, since: DateTime<Utc>) -> Result<u64>;

    /// Groups of documents sharing a `uid`, only groups with more than one
    /// member, each in insertion order.
    async fn duplicate_groups(&self, collection: &str) -> Result<Vec<Vec<Document>>>;

    async fn delete_ids(&self, collection: &str, doc_ids: &[i64]) -> Result<u64>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Whether [`DocumentStore::rename`] is available and atomic.
    fn supports_rename(&self) -> bool {
        false
    }

    /// Atomically move every document of `from` into `to`. Fails if `to`
    /// already exists.
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Err(DbError::Unsupported(format!("rename {from} -> {to}")).into())
    }

    /// Copy every document of `from` into `to`. Returns the copied count.
    async fn copy(&self, from: &str, to: &str) -> Result<u64>;

    /// Remove every document of a collection, returning how many there were.
    async fn truncate(&self, collection: &str) -> Result<u64>;

    async fn drop_collection(&self, collection: &str) -> Result<u64> {
        self.truncate(collection).await
    }
}

/// SQLite implementation: every collection lives in one `documents` table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    doc_id: i64,
    uid: String,
    parent_uid: String,
    created_at: Option<String>,
    updated_at: Option<String>,
    body: String,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document> {
        Ok(Document {
            doc_id: self.doc_id,
            uid: self.uid,
            parent_uid: self.parent_uid,
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            updated_at: self.updated_at.as_deref().and_then(parse_timestamp),
            body: serde_json::from_str(&self.body).map_err(DbError::from)?,
        })
    }
}

const DOCUMENT_COLUMNS: &str = "doc_id, uid, parent_uid, created_at, updated_at, body";

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(DbError::from)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(DbError::from)?;

        Self::from_pool(pool).await
    }

    /// Single-connection in-memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::from)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (\
                doc_id INTEGER PRIMARY KEY AUTOINCREMENT, \
                collection TEXT NOT NULL, \
                uid TEXT NOT NULL, \
                parent_uid TEXT NOT NULL DEFAULT '', \
                created_at TEXT, \
                updated_at TEXT, \
                body TEXT NOT NULL, \
                UNIQUE (collection, uid, parent_uid))",
        )
        .execute(&pool)
        .await
        .map_err(DbError::from)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS documents_collection_updated \
             ON documents (collection, updated_at)",
        )
        .execute(&pool)
        .await
        .map_err(DbError::from)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert(&self, collection: &str, document: NewDocument) -> Result<UpsertOutcome> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT doc_id FROM documents WHERE collection = ? AND uid = ? AND parent_uid = ?",
        )
        .bind(collection)
        .bind(&document.uid)
        .bind(&document.parent_uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        let body = serde_json::to_string(&document.body).map_err(DbError::from)?;
        sqlx::query(
            "INSERT INTO documents (collection, uid, parent_uid, created_at, updated_at, body) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (collection, uid, parent_uid) DO UPDATE SET \
                created_at = excluded.created_at, \
                updated_at = excluded.updated_at, \
                body = excluded.body",
        )
        .bind(collection)
        .bind(&document.uid)
        .bind(&document.parent_uid)
        .bind(document.created_at.map(format_timestamp))
        .bind(document.updated_at.map(format_timestamp))
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(match existing {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn find(&self, collection: &str) -> Result<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ? ORDER BY doc_id"
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count as u64)
    }

    async fn count_updated_since(&self, collection: &str, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE collection = ? AND updated_at >= ?",
        )
        .bind(collection)
        .bind(format_timestamp(since))
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(count as u64)
    }

    async fn duplicate_groups(&self, collection: &str) -> Result<Vec<Vec<Document>>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE collection = ? AND uid IN ( \
                SELECT uid FROM documents WHERE collection = ? \
                GROUP BY uid HAVING COUNT(*) > 1) \
             ORDER BY doc_id"
        ))
        .bind(collection)
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let mut groups: BTreeMap<String, Vec<Document>> = BTreeMap::new();
        for row in rows {
            let document = row.into_document()?;
            groups.entry(document.uid.clone()).or_default().push(document);
        }
        Ok(groups.into_values().collect())
    }

    async fn delete_ids(&self, collection: &str, doc_ids: &[i64]) -> Result<u64> {
        let mut deleted = 0;
        let mut transaction = self.pool.begin().await.map_err(DbError::from)?;
        for doc_id in doc_ids {
            deleted += sqlx::query("DELETE FROM documents WHERE collection = ? AND doc_id = ?")
                .bind(collection)
                .bind(doc_id)
                .execute(&mut *transaction)
                .await
                .map_err(DbError::from)?
                .rows_affected();
        }
        transaction.commit().await.map_err(DbError::from)?;
        Ok(deleted)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT collection FROM documents ORDER BY collection")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::from)?;
        Ok(names)
    }

    fn supports_rename(&self) -> bool {
        true
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut transaction = self.pool.begin().await.map_err(DbError::from)?;

        let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(to)
            .fetch_one(&mut *transaction)
            .await
            .map_err(DbError::from)?;
        if taken > 0 {
            return Err(DbError::CollectionExists(to.to_string()).into());
        }

        sqlx::query("UPDATE documents SET collection = ? WHERE collection = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *transaction)
            .await
            .map_err(DbError::from)?;

        transaction.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<u64> {
        let copied = sqlx::query(
            "INSERT INTO documents (collection, uid, parent_uid, created_at, updated_at, body) \
             SELECT ?, uid, parent_uid, created_at, updated_at, body \
             FROM documents WHERE collection = ? ORDER BY doc_id",
        )
        .bind(to)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?
        .rows_affected();
        Ok(copied)
    }

    async fn truncate(&self, collection: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?
            .rows_affected();
        Ok(removed)
    }
}
