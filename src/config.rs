//! Layered configuration: built-in defaults, an optional TOML file, then
//! `EVENTINDEX__*` environment variables.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "EVENTINDEX";
const DEFAULT_CONFIG_FILE: &str = "eventindex.toml";

/// Full application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub catalog: CatalogConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub curation: CurationConfig,
    pub index: IndexConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

/// Document store location and collection names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file holding collections and run history.
    pub path: PathBuf,
    pub agendas_collection: String,
    pub events_collection: String,
    /// How collections are archived before a run.
    pub archive_strategy: ArchiveStrategy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/corpus.db"),
            agendas_collection: "agendas".into(),
            events_collection: "events".into(),
            archive_strategy: ArchiveStrategy::Auto,
        }
    }
}

/// Archival move strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStrategy {
    /// Native rename when the backend supports it, copy-then-truncate otherwise.
    Auto,
    /// Always copy through a staging collection, then truncate the source.
    CopyThenTruncate,
}

/// Upstream catalog endpoint and query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub agendas_endpoint: String,
    pub events_path_suffix: String,
    /// Region used both as agenda search term and event filter.
    pub region: Option<String>,
    pub language: String,
    pub official_only: bool,
    pub page_size: usize,
    /// Per-request timeout.
    pub timeout_secs: u64,
    pub include_fields: Vec<String>,
    /// Watermark for full runs. Defaults to `initial_lookback_days` ago.
    pub initial_watermark: Option<String>,
    pub initial_lookback_days: i64,
    /// Drop events whose own createdAt/updatedAt predate the watermark
    /// during incremental runs.
    pub date_filter: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openagenda.com/v2".into(),
            api_key: None,
            agendas_endpoint: "/agendas".into(),
            events_path_suffix: "/events".into(),
            region: None,
            language: "fr".into(),
            official_only: true,
            page_size: 100,
            timeout_secs: 30,
            include_fields: default_event_fields(),
            initial_watermark: None,
            initial_lookback_days: 365,
            date_filter: true,
        }
    }
}

fn default_event_fields() -> Vec<String> {
    [
        "uid",
        "keywords",
        "attendanceMode",
        "dateRange",
        "description",
        "longDescription",
        "title",
        "status",
        "firstTiming",
        "lastTiming",
        "conditions",
        "location.name",
        "location.address",
        "location.city",
        "location.department",
        "location.region",
        "location.postalCode",
        "location.latitude",
        "location.longitude",
        "createdAt",
        "updatedAt",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Embedding model location and batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Directory containing `model.onnx` (or `onnx/model.onnx`) and `tokenizer.json`.
    pub model_dir: PathBuf,
    /// Identifier recorded in run metadata and index manifests.
    pub model_id: String,
    /// Output width of the model.
    pub dimension: usize,
    pub batch_size: usize,
    /// Maximum tokens per input; longer inputs are truncated.
    pub max_length: usize,
    /// ONNX Runtime intra-op threads.
    pub intra_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models/multilingual-e5-large"),
            model_id: "intfloat/multilingual-e5-large".into(),
            dimension: 1024,
            batch_size: 32,
            max_length: 512,
            intra_threads: 2,
        }
    }
}

/// Text window sizes, in characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    /// Events with a shorter long description are removed.
    pub min_description_chars: usize,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            min_description_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory holding the persisted vector index.
    pub path: PathBuf,
    /// Result count used when a search does not specify one.
    pub default_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/vector_index"),
            default_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// When set, logs are also written to daily-rolling files here.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (or the default locations), then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(path) = default_config_path() {
                    tracing::debug!(path = %path.display(), "using config file");
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        let loaded: AppConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject parameter combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunking.chunk_size must be > 0".into()).into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            ))
            .into());
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::Invalid("embedding.batch_size must be > 0".into()).into());
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be > 0".into()).into());
        }
        if self.catalog.page_size == 0 {
            return Err(ConfigError::Invalid("catalog.page_size must be > 0".into()).into());
        }
        if self.store.agendas_collection == self.store.events_collection {
            return Err(ConfigError::Invalid(
                "store.agendas_collection and store.events_collection must differ".into(),
            )
            .into());
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("eventindex").join(DEFAULT_CONFIG_FILE))
        .filter(|path| path.is_file())
}
