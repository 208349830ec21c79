//! On-disk persistence of a [`VectorIndex`].
//!
//! Layout: a directory with `manifest.json` plus a LanceDB dataset holding
//! the `chunks` table. Replacement goes through a sibling staging directory
//! so a failed save never touches the live index.

use crate::error::{IndexError, Result};
use crate::vector::index::VectorIndex;
use crate::vector::table::ChunkTable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "manifest.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub dimension: usize,
    pub count: usize,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

/// Handle on the index directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.join(MANIFEST_FILE).is_file()
    }

    /// Write `index` to the index directory, which must not already hold an
    /// index.
    pub async fn save(&self, index: &VectorIndex) -> Result<()> {
        save_to(&self.path, index).await
    }

    /// Load the index, requiring its width to equal `expected_dimension`.
    pub async fn load(&self, expected_dimension: usize) -> Result<VectorIndex> {
        if !self.path.is_dir() {
            return Err(IndexError::NotFound(self.path.clone()).into());
        }

        let manifest = self.read_manifest().await?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(self.corrupt(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }
        if manifest.dimension != expected_dimension {
            return Err(IndexError::DimensionMismatch {
                index: manifest.dimension,
                encoder: expected_dimension,
            }
            .into());
        }

        let connection = connect(&self.path).await?;
        let table = ChunkTable::open(&connection, manifest.dimension).await?;
        let entries = table.read_all().await?;
        if entries.len() != manifest.count {
            return Err(self.corrupt(format!(
                "manifest lists {} vectors but the table holds {}",
                manifest.count,
                entries.len()
            )));
        }

        let index = VectorIndex::from_entries(
            manifest.dimension,
            manifest.model_id,
            manifest.created_at,
            entries,
        )?;
        tracing::info!(
            path = %self.path.display(),
            count = index.len(),
            dimension = index.dimension(),
            "vector index loaded"
        );
        Ok(index)
    }

    /// Remove the index directory. A missing directory is not an error.
    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "vector index deleted");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "no vector index to delete");
                Ok(())
            }
            Err(error) => Err(IndexError::Io(error).into()),
        }
    }

    /// Save into a staging sibling, then swap it in for the current
    /// directory. On save failure the staging directory is removed and the
    /// existing index is left as it was.
    pub async fn replace(&self, index: &VectorIndex) -> Result<()> {
        let staging = self.staging_path();
        remove_if_present(&staging).await?;

        if let Err(error) = save_to(&staging, index).await {
            tracing::error!(%error, staging = %staging.display(), "saving new index failed, keeping current one");
            if let Err(cleanup) = remove_if_present(&staging).await {
                tracing::warn!(error = %cleanup, "failed to remove staging directory");
            }
            return Err(error);
        }

        self.delete().await?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(IndexError::Io)?;

        tracing::info!(path = %self.path.display(), count = index.len(), "vector index replaced");
        Ok(())
    }

    async fn read_manifest(&self) -> Result<Manifest> {
        let path = self.path.join(MANIFEST_FILE);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| self.corrupt(format!("cannot read {MANIFEST_FILE}: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| self.corrupt(format!("invalid {MANIFEST_FILE}: {e}")))
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        self.path.with_file_name(format!("{name}.staging"))
    }

    fn corrupt(&self, reason: String) -> crate::Error {
        IndexError::Corrupt {
            path: self.path.clone(),
            reason,
        }
        .into()
    }
}

/// Source of the index a rebuild hands over to the query path.
#[async_trait]
pub trait IndexLoader: Send + Sync {
    async fn load_index(&self, store: &IndexStore, dimension: usize) -> Result<VectorIndex>;
}

/// Reads the index straight from its directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskLoader;

#[async_trait]
impl IndexLoader for DiskLoader {
    async fn load_index(&self, store: &IndexStore, dimension: usize) -> Result<VectorIndex> {
        store.load(dimension).await
    }
}

async fn save_to(path: &Path, index: &VectorIndex) -> Result<()> {
    if index.is_empty() {
        return Err(IndexError::Empty.into());
    }
    tokio::fs::create_dir_all(path).await.map_err(IndexError::Io)?;

    let connection = connect(path).await?;
    let table = ChunkTable::create(&connection, index.dimension(), index.entries()).await?;
    let written = table.count().await?;
    if written != index.len() {
        return Err(IndexError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("wrote {written} rows for {} vectors", index.len()),
        }
        .into());
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        dimension: index.dimension(),
        count: index.len(),
        model_id: index.model_id().to_string(),
        created_at: index.created_at(),
    };
    let raw = serde_json::to_string_pretty(&manifest).map_err(crate::error::DbError::from)?;
    // Manifest last: a directory without one is never mistaken for an index.
    tokio::fs::write(path.join(MANIFEST_FILE), raw)
        .await
        .map_err(IndexError::Io)?;

    tracing::debug!(path = %path.display(), count = index.len(), "vector index saved");
    Ok(())
}

async fn connect(path: &Path) -> Result<lancedb::Connection> {
    let uri = path.to_str().ok_or_else(|| IndexError::Corrupt {
        path: path.to_path_buf(),
        reason: "index path is not valid UTF-8".into(),
    })?;
    lancedb::connect(uri)
        .execute()
        .await
        .map_err(|e| crate::error::DbError::LanceDb(e.to_string()).into())
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(IndexError::Io(error).into()),
    }
}
