//! Error types for the indexing pipeline.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error, one variant per concern.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration and parameter validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Document store and vector table errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("lancedb error: {0}")]
    LanceDb(String),

    #[error("collection '{0}' already exists")]
    CollectionExists(String),

    #[error("copy of '{from}' into '{to}' is incomplete: expected {expected} documents, found {found}")]
    IncompleteCopy {
        from: String,
        to: String,
        expected: u64,
        found: u64,
    },

    #[error("operation not supported by this store: {0}")]
    Unsupported(String),

    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize stored document: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tokenization and inference errors. None of these fall back to zero vectors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("failed to load embedding model from {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("embedding dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("embedding task failed: {0}")]
    Task(String),
}

/// Upstream catalog errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("catalog response could not be decoded: {0}")]
    Decode(String),
}

/// Vector index build/persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("refusing to build an empty index: no chunks were produced")]
    Empty,

    #[error("index dimension mismatch: index has {index}, encoder produces {encoder}")]
    DimensionMismatch { index: usize, encoder: usize },

    #[error("index not found at {0}")]
    NotFound(PathBuf),

    #[error("index at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("index i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Preconditions checked by the rebuild pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no previous pipeline run found; build the initial index with a full rebuild")]
    NoPreviousRun,

    #[error("the document store holds no events to index")]
    EmptyCorpus,

    #[error("rebuild cancelled")]
    Cancelled,
}
