//! Snapshot-then-clear of mutable collections, plus backup maintenance.

use crate::config::ArchiveStrategy;
use crate::corpus::store::DocumentStore;
use crate::error::{DbError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;

const STAGING_SUFFIX: &str = "__staging";
const BACKUP_PATTERN: &str = r"^(.+)_(backup|update)_(\d{8})_(\d{6})(_\d+)?$";

/// Naming family of a backup: full rebuilds vs. incremental updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    fn tag(self) -> &'static str {
        match self {
            BackupKind::Full => "backup",
            BackupKind::Incremental => "update",
        }
    }
}

/// What happened to one collection during [`backup_and_clear`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveOutcome {
    pub collection: String,
    pub backed_up: bool,
    pub cleared: bool,
    pub count: u64,
    pub backup_name: Option<String>,
}

/// An archived collection found by [`list_backups`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub source: String,
    pub kind: BackupKind,
    pub created_at: NaiveDateTime,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub dry_run: bool,
    pub collections: Vec<String>,
    pub documents: u64,
}

/// Move each non-empty collection to a timestamped backup name, leaving the
/// original empty. Empty or missing collections are skipped.
pub async fn backup_and_clear(
    store: &dyn DocumentStore,
    collections: &[&str],
    kind: BackupKind,
    strategy: ArchiveStrategy,
    now: DateTime<Utc>,
) -> Result<Vec<ArchiveOutcome>> {
    cleanup_staging(store).await?;

    let mut outcomes = Vec::with_capacity(collections.len());
    for &collection in collections {
        let count = store.count(collection).await?;
        if count == 0 {
            tracing::info!(collection, "collection empty or missing, no backup needed");
            outcomes.push(ArchiveOutcome {
                collection: collection.to_string(),
                backed_up: false,
                cleared: false,
                count: 0,
                backup_name: None,
            });
            continue;
        }

        let existing = store.list_collections().await?;
        let base = format!("{collection}_{}_{}", kind.tag(), now.format("%Y%m%d_%H%M%S"));
        let target = unique_name(&existing, &base);

        let moved = move_collection(store, collection, &target, strategy).await?;
        tracing::info!(collection, backup = %target, documents = moved, "collection archived");

        outcomes.push(ArchiveOutcome {
            collection: collection.to_string(),
            backed_up: true,
            cleared: true,
            count: moved,
            backup_name: Some(target),
        });
    }

    Ok(outcomes)
}

/// `base`, or `base_2`, `base_3`, ... if taken.
fn unique_name(existing: &[String], base: &str) -> String {
    if !existing.iter().any(|name| name == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !existing.iter().any(|name| name == candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Move every document of `from` into the new collection `to`.
async fn move_collection(
    store: &dyn DocumentStore,
    from: &str,
    to: &str,
    strategy: ArchiveStrategy,
) -> Result<u64> {
    if strategy == ArchiveStrategy::Auto && store.supports_rename() {
        store.rename(from, to).await?;
        return store.count(to).await;
    }

    if store.count(to).await? > 0 {
        return Err(DbError::CollectionExists(to.to_string()).into());
    }

    let expected = store.count(from).await?;
    let staging = format!("{to}{STAGING_SUFFIX}");
    store.drop_collection(&staging).await?;

    store.copy(from, &staging).await?;
    verify_copy(store, from, &staging, expected).await?;

    store.copy(&staging, to).await?;
    verify_copy(store, &staging, to, expected).await?;

    store.drop_collection(&staging).await?;
    store.truncate(from).await?;
    Ok(expected)
}

async fn verify_copy(store: &dyn DocumentStore, from: &str, to: &str, expected: u64) -> Result<()> {
    let found = store.count(to).await?;
    if found != expected {
        return Err(DbError::IncompleteCopy {
            from: from.to_string(),
            to: to.to_string(),
            expected,
            found,
        }
        .into());
    }
    Ok(())
}

/// Drop staging collections left behind by an interrupted move.
pub async fn cleanup_staging(store: &dyn DocumentStore) -> Result<u64> {
    let mut dropped = 0;
    for name in store.list_collections().await? {
        if name.ends_with(STAGING_SUFFIX) {
            let documents = store.drop_collection(&name).await?;
            tracing::warn!(collection = %name, documents, "dropped leftover staging collection");
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Archived collections with their document counts, newest first.
pub async fn list_backups(store: &dyn DocumentStore) -> Result<Vec<BackupInfo>> {
    let pattern = Regex::new(BACKUP_PATTERN).map_err(|e| anyhow::anyhow!(e))?;

    let mut backups = Vec::new();
    for name in store.list_collections().await? {
        let Some(captures) = pattern.captures(&name) else {
            continue;
        };
        let kind = match &captures[2] {
            "backup" => BackupKind::Full,
            _ => BackupKind::Incremental,
        };
        let stamp = format!("{}_{}", &captures[3], &captures[4]);
        let Ok(created_at) = NaiveDateTime::parse_from_str(&stamp, "%Y%m%d_%H%M%S") else {
            tracing::debug!(collection = %name, "backup-like name with invalid timestamp, ignoring");
            continue;
        };
        let count = store.count(&name).await?;
        backups.push(BackupInfo {
            source: captures[1].to_string(),
            name,
            kind,
            created_at,
            count,
        });
    }

    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(backups)
}

/// Drop the given backups. A dry run only reports what would be dropped.
pub async fn delete_backups(
    store: &dyn DocumentStore,
    backups: &[BackupInfo],
    dry_run: bool,
) -> Result<DeleteReport> {
    let mut report = DeleteReport {
        dry_run,
        ..DeleteReport::default()
    };

    for backup in backups {
        if dry_run {
            report.documents += backup.count;
        } else {
            report.documents += store.drop_collection(&backup.name).await?;
            tracing::info!(collection = %backup.name, "backup deleted");
        }
        report.collections.push(backup.name.clone());
    }

    Ok(report)
}
