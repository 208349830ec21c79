//! Background rebuild task and the serving index it swaps.

use crate::corpus::RunMode;
use crate::error::{EmbeddingError, Error, IndexError, PipelineError, Result};
use crate::rebuild::pipeline::{Pipeline, RunOutcome};
use crate::rebuild::status::{RebuildState, RebuildStatus};
use crate::vector::{IndexStats, SearchHit, VectorIndex};
use arc_swap::ArcSwapOption;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument as _;

/// Owns the rebuild status, the single-flight guard and the index that
/// queries are served from.
pub struct Rebuilder {
    pipeline: Arc<Pipeline>,
    serving: ArcSwapOption<VectorIndex>,
    status: watch::Sender<RebuildStatus>,
    /// Cancellation signal of the rebuild in flight.
    cancel: Mutex<Option<watch::Sender<bool>>>,
    /// Join handle of the latest rebuild. Never held across an await.
    task: Mutex<Option<JoinHandle<RebuildStatus>>>,
}

impl std::fmt::Debug for Rebuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebuilder")
            .field("pipeline", &self.pipeline)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Rebuilder {
    pub fn new(pipeline: Arc<Pipeline>) -> Arc<Self> {
        let (status, _) = watch::channel(RebuildStatus::idle(None));
        Arc::new(Self {
            pipeline,
            serving: ArcSwapOption::empty(),
            status,
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Load the persisted index, if any, and the last watermark. A missing or
    /// unreadable index leaves search unavailable until a rebuild succeeds.
    pub async fn initialize(&self) -> Result<()> {
        let watermark = self.pipeline.last_watermark().await?;
        self.status.send_modify(|status| status.last_watermark = watermark);

        if !self.pipeline.index_store().exists() {
            tracing::warn!(
                path = %self.pipeline.index_store().path().display(),
                "no vector index on disk, run a full rebuild"
            );
            return Ok(());
        }
        match self.pipeline.load_index().await {
            Ok(index) => self.serving.store(Some(Arc::new(index))),
            Err(error) => tracing::error!(%error, "failed to load vector index, search disabled"),
        }
        Ok(())
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Start a rebuild unless one is already running. Either way the
    /// returned status is the one now in effect.
    pub fn trigger(self: &Arc<Self>, mode: RunMode) -> RebuildStatus {
        let started_at = Utc::now();
        let started = self.status.send_if_modified(|status| {
            if status.state == RebuildState::Running {
                return false;
            }
            *status = RebuildStatus::running(mode, started_at, status.last_watermark);
            true
        });
        if !started {
            tracing::info!("rebuild already running, ignoring trigger");
            return self.status();
        }

        let status = self.status();
        let span = tracing::info_span!(
            "rebuild",
            run_id = %status.run_id.unwrap_or_default(),
            mode = mode.as_str()
        );
        tracing::info!(parent: &span, "rebuild started");

        let (cancel, cancel_rx) = watch::channel(false);
        *lock(&self.cancel) = Some(cancel);

        let this = Arc::clone(self);
        let join = tokio::spawn(this.execute(mode, cancel_rx).instrument(span));
        *lock(&self.task) = Some(join);
        status
    }

    pub fn status(&self) -> RebuildStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RebuildStatus> {
        self.status.subscribe()
    }

    /// Ask the running rebuild to stop at its next step boundary. Returns
    /// whether there was a rebuild to cancel.
    pub fn cancel(&self) -> bool {
        if self.status.borrow().state != RebuildState::Running {
            return false;
        }
        match lock(&self.cancel).as_ref() {
            Some(cancel) => {
                tracing::info!("rebuild cancellation requested");
                cancel.send(true).is_ok()
            }
            None => false,
        }
    }

    /// Wait for the current rebuild, if any, and return the final status.
    pub async fn wait(&self) -> RebuildStatus {
        let join = lock(&self.task).take();
        let Some(join) = join else {
            let mut updates = self.subscribe();
            return match updates.wait_for(|status| status.state != RebuildState::Running).await {
                Ok(status) => status.clone(),
                Err(_) => self.status(),
            };
        };

        match join.await {
            Ok(status) => status,
            Err(error) => {
                tracing::error!(%error, "rebuild task aborted");
                let failed = self
                    .status()
                    .finish(RebuildState::Error, format!("rebuild task aborted: {error}"));
                self.status.send_replace(failed.clone());
                failed
            }
        }
    }

    pub fn serving_index(&self) -> Option<Arc<VectorIndex>> {
        self.serving.load_full()
    }

    pub fn stats(&self) -> Option<IndexStats> {
        self.serving.load_full().map(|index| index.stats())
    }

    /// Encode `query` and return the `k` nearest chunks from the index being
    /// served. A rebuild in progress does not affect the result.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let index = self
            .serving_index()
            .ok_or_else(|| IndexError::NotFound(self.pipeline.index_store().path().to_path_buf()))?;
        let vector = self.pipeline.encoder().encode_query(query).await?;

        tokio::task::spawn_blocking(move || index.search(&vector, k))
            .await
            .map_err(|e| EmbeddingError::Task(e.to_string()))?
    }

    async fn execute(self: Arc<Self>, mode: RunMode, cancel: watch::Receiver<bool>) -> RebuildStatus {
        let progress = |message: &str| {
            self.status
                .send_modify(|status| status.message = message.to_string());
        };
        let result = self.pipeline.run(mode, &cancel, &progress).await;
        let current = self.status();

        let last = match result {
            Ok(RunOutcome::NothingToDo { watermark }) => current.finish(
                RebuildState::Warning,
                format!("no new events since {watermark}, index left as is"),
            ),
            Ok(RunOutcome::Completed { watermark, summary }) => {
                let mut last = match self.pipeline.load_index().await {
                    Ok(index) => {
                        let count = index.len();
                        self.serving.store(Some(Arc::new(index)));
                        tracing::info!(count, "serving index swapped");
                        current.finish(
                            RebuildState::Success,
                            format!(
                                "indexed {} chunks from {} events",
                                summary.chunks_created, summary.events_processed
                            ),
                        )
                    }
                    Err(error) => {
                        tracing::error!(%error, "new index written but could not be loaded");
                        current.finish(
                            RebuildState::SuccessWithWarning,
                            format!("index rebuilt on disk but not loaded ({error}); restart to serve it"),
                        )
                    }
                };
                // The run just recorded becomes the next watermark.
                last.last_watermark = match self.pipeline.last_watermark().await {
                    Ok(latest) => latest.or(Some(watermark)),
                    Err(_) => Some(watermark),
                };
                last.details = Some(summary);
                last
            }
            Err(Error::Pipeline(PipelineError::Cancelled)) => {
                tracing::warn!("rebuild cancelled");
                current.finish(RebuildState::Error, "cancelled")
            }
            Err(error) => {
                tracing::error!(%error, "rebuild failed");
                current.finish(RebuildState::Error, error.to_string())
            }
        };

        *lock(&self.cancel) = None;
        self.status.send_replace(last.clone());
        last
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
