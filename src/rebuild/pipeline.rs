//! The ordered steps of one rebuild: archive, fetch, clean, chunk, embed,
//! replace the on-disk index, record the run.

use crate::chunks::Chunker;
use crate::config::{AppConfig, ArchiveStrategy};
use crate::corpus::archive::{self, BackupKind};
use crate::corpus::{
    CatalogSource, DocumentStore, HttpCatalog, RunLog, RunMode, RunRecord, SqliteStore, curation,
    dedup, ingest, models, runs,
};
use crate::embedding::Encoder;
use crate::error::{ConfigError, PipelineError, Result};
use crate::rebuild::status::RunSummary;
use crate::vector::{DiskLoader, IndexLoader, IndexStore, VectorIndex};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Settings the pipeline reads on every run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub agendas_collection: String,
    pub events_collection: String,
    pub archive_strategy: ArchiveStrategy,
    pub region: Option<String>,
    pub min_description_chars: usize,
    /// Apply the per-event date filter on incremental runs.
    pub date_filter: bool,
    pub initial_watermark: Option<DateTime<Utc>>,
    pub initial_lookback_days: i64,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let initial_watermark = match config.catalog.initial_watermark.as_deref() {
            Some(raw) => Some(models::parse_timestamp(raw).ok_or_else(|| {
                ConfigError::Invalid(format!("catalog.initial_watermark '{raw}' is not a timestamp"))
            })?),
            None => None,
        };

        Ok(Self {
            agendas_collection: config.store.agendas_collection.clone(),
            events_collection: config.store.events_collection.clone(),
            archive_strategy: config.store.archive_strategy,
            region: config.catalog.region.clone(),
            min_description_chars: config.curation.min_description_chars,
            date_filter: config.catalog.date_filter,
            initial_watermark,
            initial_lookback_days: config.catalog.initial_lookback_days,
        })
    }

    fn full_watermark(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.initial_watermark
            .unwrap_or_else(|| now - Duration::days(self.initial_lookback_days))
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing changed upstream since the watermark; no work was done.
    NothingToDo { watermark: DateTime<Utc> },
    /// A new index was written to disk and the run was recorded.
    Completed {
        watermark: DateTime<Utc>,
        summary: RunSummary,
    },
}

/// Progress callback, one short message per step.
pub type Progress<'a> = &'a (dyn Fn(&str) + Send + Sync);

pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    runs: RunLog,
    catalog: Arc<dyn CatalogSource>,
    encoder: Arc<Encoder>,
    index_store: IndexStore,
    loader: Arc<dyn IndexLoader>,
    chunker: Chunker,
    settings: PipelineSettings,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("index", &self.index_store.path())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        runs: RunLog,
        catalog: Arc<dyn CatalogSource>,
        encoder: Arc<Encoder>,
        index_store: IndexStore,
        chunker: Chunker,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            runs,
            catalog,
            encoder,
            index_store,
            loader: Arc::new(DiskLoader),
            chunker,
            settings,
        }
    }

    /// Replace how the persisted index is read back after a rebuild and at
    /// startup.
    pub fn with_loader(mut self, loader: Arc<dyn IndexLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Wire up the production pipeline: SQLite store, HTTP catalog, ONNX
    /// encoder.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.store.path).await?;
        let runs = RunLog::new(store.pool().clone()).await?;
        let catalog = HttpCatalog::new(config.catalog.clone())?;
        let encoder = tokio::task::spawn_blocking({
            let embedding = config.embedding.clone();
            move || Encoder::from_config(&embedding)
        })
        .await
        .map_err(|e| crate::error::EmbeddingError::Task(e.to_string()))??;
        let chunker = Chunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap)?;

        Ok(Self::new(
            Arc::new(store),
            runs,
            Arc::new(catalog),
            Arc::new(encoder),
            IndexStore::new(&config.index.path),
            chunker,
            PipelineSettings::from_config(config)?,
        ))
    }

    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.encoder
    }

    pub fn index_store(&self) -> &IndexStore {
        &self.index_store
    }

    pub fn runs(&self) -> &RunLog {
        &self.runs
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Load the persisted index at the encoder's width.
    pub async fn load_index(&self) -> Result<VectorIndex> {
        self.loader
            .load_index(&self.index_store, self.encoder.dimension())
            .await
    }

    /// Watermark of the latest recorded run, if any.
    pub async fn last_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.runs.latest_run().await?.map(|run| run.run_at))
    }

    /// Execute every step in order. `cancel` is checked between steps.
    pub async fn run(
        &self,
        mode: RunMode,
        cancel: &watch::Receiver<bool>,
        progress: Progress<'_>,
    ) -> Result<RunOutcome> {
        let run_at = Utc::now();
        let events = self.settings.events_collection.as_str();
        let agendas = self.settings.agendas_collection.as_str();

        let watermark = match mode {
            RunMode::Incremental => {
                let watermark = self
                    .last_watermark()
                    .await?
                    .ok_or(PipelineError::NoPreviousRun)?;

                let changed = self.store.count_updated_since(events, watermark).await?;
                if changed == 0 {
                    tracing::warn!(%watermark, "no events updated since the last run, skipping rebuild");
                    return Ok(RunOutcome::NothingToDo { watermark });
                }
                tracing::info!(%watermark, changed, "events updated since the last run");
                watermark
            }
            RunMode::Full => self.settings.full_watermark(run_at),
        };
        let mut summary = RunSummary::default();

        checkpoint(cancel)?;
        progress("archiving collections");
        let kind = match mode {
            RunMode::Full => BackupKind::Full,
            RunMode::Incremental => BackupKind::Incremental,
        };
        let archived = archive::backup_and_clear(
            self.store.as_ref(),
            &[agendas, events],
            kind,
            self.settings.archive_strategy,
            run_at,
        )
        .await?;
        summary.backups = archived
            .into_iter()
            .filter_map(|outcome| outcome.backup_name)
            .collect();

        checkpoint(cancel)?;
        progress("fetching agendas");
        let agenda_stats =
            ingest::fetch_agendas(self.catalog.as_ref(), self.store.as_ref(), agendas, watermark)
                .await?;
        if agenda_stats.listing_interrupted {
            tracing::warn!(
                fetched = agenda_stats.fetched,
                "agenda listing interrupted, indexing the agendas fetched so far"
            );
        }

        checkpoint(cancel)?;
        progress("fetching events");
        let date_filter = (mode == RunMode::Incremental && self.settings.date_filter).then_some(watermark);
        let event_stats = ingest::fetch_events(
            self.catalog.as_ref(),
            self.store.as_ref(),
            agendas,
            events,
            date_filter,
        )
        .await?;
        summary.events_fetched = event_stats.fetched;
        summary.records_rejected = agenda_stats.rejected + event_stats.rejected;
        summary.events_filtered_by_date = event_stats.filtered_by_date;
        summary.failed_agendas = event_stats.failed_agendas;

        checkpoint(cancel)?;
        progress("removing duplicates");
        summary.duplicates_deleted = dedup::deduplicate(self.store.as_ref(), events).await?.deleted;

        checkpoint(cancel)?;
        progress("removing thin events");
        summary.thin_events_deleted = curation::remove_thin_events(
            self.store.as_ref(),
            events,
            self.settings.min_description_chars,
        )
        .await?
        .deleted;

        checkpoint(cancel)?;
        progress("chunking events");
        let documents = self.store.find(events).await?;
        if documents.is_empty() {
            return Err(PipelineError::EmptyCorpus.into());
        }
        summary.events_processed = documents.len() as u64;
        let chunks = self.chunker.split_documents(&documents);
        summary.chunks_created = chunks.len() as u64;
        tracing::info!(
            events = summary.events_processed,
            chunks = summary.chunks_created,
            "events chunked"
        );

        checkpoint(cancel)?;
        progress("embedding chunks");
        let index = VectorIndex::build_async(chunks, self.encoder.clone()).await?;

        checkpoint(cancel)?;
        progress("writing index");
        self.index_store.replace(&index).await?;

        self.runs
            .record_run(&RunRecord {
                run_at,
                watermark,
                months_back: runs::months_back(run_at, watermark),
                events_processed: summary.events_processed,
                chunks_created: summary.chunks_created,
                region: self.settings.region.clone(),
                embedding_model: self.encoder.model_id().to_string(),
                chunk_size: self.chunker.max_chars(),
                chunk_overlap: self.chunker.overlap_chars(),
                mode,
            })
            .await?;

        tracing::info!(
            mode = mode.as_str(),
            events = summary.events_processed,
            chunks = summary.chunks_created,
            "rebuild pipeline finished"
        );
        Ok(RunOutcome::Completed { watermark, summary })
    }
}

fn checkpoint(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        return Err(PipelineError::Cancelled.into());
    }
    Ok(())
}
