//! End-to-end rebuild runs against an in-memory store, a scripted catalog and
//! a bag-of-words encoder.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use eventindex::chunks::Chunker;
use eventindex::config::AppConfig;
use eventindex::corpus::catalog::{AgendaQuery, EventQuery};
use eventindex::corpus::{
    CatalogPage, CatalogSource, DocumentStore, NewDocument, RunLog, RunMode, SqliteStore,
};
use eventindex::embedding::{Encoder, TokenEncoder, TokenStates};
use eventindex::error::IndexError;
use eventindex::rebuild::{Pipeline, PipelineSettings, RebuildState, Rebuilder};
use eventindex::vector::{IndexLoader, IndexStore, VectorIndex};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

const DIMENSION: usize = 256;

/// One-hot row per word, bucketed by hash. Pooled output is a normalized
/// bag of words, so texts sharing words land close together.
struct WordEncoder;

fn bucket(word: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % DIMENSION as u64) as usize
}

impl TokenEncoder for WordEncoder {
    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn forward(&self, texts: &[String]) -> eventindex::Result<TokenStates> {
        let tokens: Vec<Vec<usize>> = texts
            .iter()
            .map(|text| {
                text.split(|c: char| !c.is_alphanumeric())
                    .filter(|word| !word.is_empty())
                    .map(|word| bucket(&word.to_lowercase()))
                    .collect()
            })
            .collect();
        let seq_len = tokens.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut hidden = Vec::with_capacity(texts.len() * seq_len * DIMENSION);
        let mut mask = Vec::with_capacity(texts.len() * seq_len);
        for sequence in &tokens {
            for position in 0..seq_len {
                let mut row = vec![0.0_f32; DIMENSION];
                match sequence.get(position) {
                    Some(&slot) => {
                        row[slot] = 1.0;
                        mask.push(1);
                    }
                    None => mask.push(0),
                }
                hidden.extend(row);
            }
        }

        Ok(TokenStates {
            batch: texts.len(),
            seq_len,
            dimension: DIMENSION,
            hidden,
            mask,
        })
    }
}

/// Catalog serving one agenda. The agenda listing can be held shut until the
/// test releases it.
struct ScriptedCatalog {
    events: Mutex<Vec<Value>>,
    gate: Option<Semaphore>,
    agenda_calls: AtomicUsize,
}

impl ScriptedCatalog {
    fn new(events: Vec<Value>) -> Self {
        Self {
            events: Mutex::new(events),
            gate: None,
            agenda_calls: AtomicUsize::new(0),
        }
    }

    fn gated(events: Vec<Value>) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(events)
        }
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    fn set_events(&self, events: Vec<Value>) {
        *self.events.lock().expect("lock") = events;
    }
}

#[async_trait]
impl CatalogSource for ScriptedCatalog {
    async fn fetch_agendas(&self, _query: &AgendaQuery) -> eventindex::Result<CatalogPage> {
        self.agenda_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        Ok(CatalogPage {
            items: vec![json!({"uid": 7, "title": "Agenda culturel", "updatedAt": Utc::now().to_rfc3339()})],
            after: None,
        })
    }

    async fn fetch_events(&self, agenda_uid: &str, _query: &EventQuery) -> eventindex::Result<CatalogPage> {
        let items = if agenda_uid == "7" {
            self.events.lock().expect("lock").clone()
        } else {
            Vec::new()
        };
        Ok(CatalogPage { items, after: None })
    }
}

/// Reads the index from disk until told to refuse.
#[derive(Default)]
struct SwitchableLoader {
    refuse: AtomicBool,
}

#[async_trait]
impl IndexLoader for SwitchableLoader {
    async fn load_index(&self, store: &IndexStore, dimension: usize) -> eventindex::Result<VectorIndex> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(IndexError::Corrupt {
                path: store.path().to_path_buf(),
                reason: "manifest unreadable".into(),
            }
            .into());
        }
        store.load(dimension).await
    }
}

fn event(uid: u64, title: &str, words: &str) -> Value {
    json!({
        "uid": uid,
        "title": {"fr": title},
        "longDescription": {"fr": format!("{words} ").repeat(6)},
        "updatedAt": Utc::now().to_rfc3339(),
    })
}

fn events() -> Vec<Value> {
    vec![
        event(1, "Jazz concert", "jazz saxophone trumpet concert"),
        event(2, "Pottery workshop", "pottery clay ceramics workshop kiln"),
    ]
}

struct Harness {
    rebuilder: Arc<Rebuilder>,
    store: Arc<SqliteStore>,
    index_dir: PathBuf,
}

async fn harness(catalog: Arc<ScriptedCatalog>, root: &Path) -> Harness {
    harness_with(catalog, root, None).await
}

async fn harness_with(
    catalog: Arc<ScriptedCatalog>,
    root: &Path,
    loader: Option<Arc<dyn IndexLoader>>,
) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    let runs = RunLog::new(store.pool().clone()).await.expect("run log");
    let index_dir = root.join("vector_index");

    let mut pipeline = Pipeline::new(
        store.clone(),
        runs,
        catalog,
        Arc::new(Encoder::new(Arc::new(WordEncoder), "bag-of-words", 8)),
        IndexStore::new(&index_dir),
        Chunker::new(500, 100).expect("chunker"),
        PipelineSettings::from_config(&AppConfig::default()).expect("settings"),
    );
    if let Some(loader) = loader {
        pipeline = pipeline.with_loader(loader);
    }
    let rebuilder = Rebuilder::new(Arc::new(pipeline));
    rebuilder.initialize().await.expect("initialize");

    Harness {
        rebuilder,
        store,
        index_dir,
    }
}

fn manifest(index_dir: &Path) -> String {
    std::fs::read_to_string(index_dir.join("manifest.json")).expect("manifest")
}

#[tokio::test]
async fn full_rebuild_serves_search() {
    let temp = tempfile::tempdir().expect("tempdir");
    let h = harness(Arc::new(ScriptedCatalog::new(events())), temp.path()).await;
    assert!(h.rebuilder.serving_index().is_none());

    h.rebuilder.trigger(RunMode::Full);
    let last = h.rebuilder.wait().await;
    assert_eq!(last.state, RebuildState::Success, "{}", last.message);

    let details = last.details.expect("run details");
    assert_eq!(details.events_processed, 2);
    assert!(details.chunks_created >= 2);
    assert!(last.last_watermark.is_some());
    assert_eq!(
        h.rebuilder.stats().expect("stats").count as u64,
        details.chunks_created
    );

    let hits = h
        .rebuilder
        .search("jazz saxophone trumpet", 3)
        .await
        .expect("search");
    assert!(!hits.is_empty());
    assert_eq!(hits[0].chunk.metadata.uid, "1");
    assert!(hits.windows(2).all(|pair| pair[0].distance <= pair[1].distance));
}

#[tokio::test]
async fn second_trigger_while_running_is_ignored() {
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(ScriptedCatalog::gated(events()));
    let h = harness(catalog.clone(), temp.path()).await;

    let first = h.rebuilder.trigger(RunMode::Full);
    assert_eq!(first.state, RebuildState::Running);

    let second = h.rebuilder.trigger(RunMode::Full);
    assert_eq!(second.state, RebuildState::Running);
    assert_eq!(second.started_at, first.started_at);
    assert_eq!(second.run_id, first.run_id);

    catalog.release();
    let last = h.rebuilder.wait().await;
    assert_eq!(last.state, RebuildState::Success, "{}", last.message);
    assert_eq!(last.run_id, first.run_id);
    assert_eq!(catalog.agenda_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_corpus_leaves_existing_index_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(ScriptedCatalog::new(events()));
    let h = harness(catalog.clone(), temp.path()).await;

    h.rebuilder.trigger(RunMode::Full);
    assert_eq!(h.rebuilder.wait().await.state, RebuildState::Success);
    let before = manifest(&h.index_dir);
    let served = h.rebuilder.stats().expect("stats");

    // Only thin events upstream now: curation leaves nothing to chunk.
    catalog.set_events(vec![json!({"uid": 3, "title": {"fr": "Bref"}, "longDescription": {"fr": "court"}})]);
    h.rebuilder.trigger(RunMode::Full);
    let last = h.rebuilder.wait().await;

    assert_eq!(last.state, RebuildState::Error);
    assert_eq!(manifest(&h.index_dir), before);
    assert_eq!(h.rebuilder.stats().expect("stats"), served);
    assert!(!temp.path().join("vector_index.staging").exists());
}

#[tokio::test]
async fn incremental_without_changes_warns_and_skips_archival() {
    let temp = tempfile::tempdir().expect("tempdir");
    let h = harness(Arc::new(ScriptedCatalog::new(events())), temp.path()).await;

    h.rebuilder.trigger(RunMode::Full);
    assert_eq!(h.rebuilder.wait().await.state, RebuildState::Success);
    let collections = h.store.list_collections().await.expect("collections");
    let before = manifest(&h.index_dir);

    h.rebuilder.trigger(RunMode::Incremental);
    let last = h.rebuilder.wait().await;

    assert_eq!(last.state, RebuildState::Warning);
    assert!(last.message.contains("no new events"));
    assert_eq!(h.store.list_collections().await.expect("collections"), collections);
    assert_eq!(manifest(&h.index_dir), before);
}

#[tokio::test]
async fn incremental_without_previous_run_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let h = harness(Arc::new(ScriptedCatalog::new(events())), temp.path()).await;

    h.rebuilder.trigger(RunMode::Incremental);
    let last = h.rebuilder.wait().await;

    assert_eq!(last.state, RebuildState::Error);
    assert!(last.message.contains("full rebuild"));
    assert!(!h.index_dir.exists());
}

#[tokio::test]
async fn cancellation_ends_in_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(ScriptedCatalog::gated(events()));
    let h = harness(catalog.clone(), temp.path()).await;

    h.rebuilder.trigger(RunMode::Full);
    assert!(h.rebuilder.cancel());
    catalog.release();

    let last = h.rebuilder.wait().await;
    assert_eq!(last.state, RebuildState::Error);
    assert_eq!(last.message, "cancelled");
    assert!(h.rebuilder.serving_index().is_none());
    assert!(!h.index_dir.exists());
}

#[tokio::test]
async fn reload_failure_keeps_serving_previous_index() {
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(ScriptedCatalog::new(events()));
    let loader = Arc::new(SwitchableLoader::default());
    let h = harness_with(catalog.clone(), temp.path(), Some(loader.clone())).await;

    h.rebuilder.trigger(RunMode::Full);
    assert_eq!(h.rebuilder.wait().await.state, RebuildState::Success);
    let served = h.rebuilder.serving_index().expect("serving index");
    let before = manifest(&h.index_dir);

    catalog.set_events(vec![event(3, "Street theatre", "theatre street actors mime juggling")]);
    loader.refuse.store(true, Ordering::SeqCst);
    h.rebuilder.trigger(RunMode::Full);
    let last = h.rebuilder.wait().await;

    assert_eq!(last.state, RebuildState::SuccessWithWarning, "{}", last.message);
    assert!(last.message.contains("manifest unreadable"), "{}", last.message);
    assert_eq!(last.details.expect("run details").events_processed, 1);
    assert_ne!(manifest(&h.index_dir), before);

    let still_served = h.rebuilder.serving_index().expect("serving index");
    assert!(Arc::ptr_eq(&still_served, &served));
    let hits = h.rebuilder.search("jazz saxophone", 1).await.expect("search");
    assert_eq!(hits[0].chunk.metadata.uid, "1");
}

#[tokio::test]
async fn reload_failure_on_first_build_leaves_search_unavailable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let loader = Arc::new(SwitchableLoader {
        refuse: AtomicBool::new(true),
    });
    let h = harness_with(Arc::new(ScriptedCatalog::new(events())), temp.path(), Some(loader)).await;

    h.rebuilder.trigger(RunMode::Full);
    let last = h.rebuilder.wait().await;

    assert_eq!(last.state, RebuildState::SuccessWithWarning, "{}", last.message);
    assert!(h.index_dir.join("manifest.json").is_file());
    assert!(h.rebuilder.serving_index().is_none());
    assert!(h.rebuilder.search("jazz", 3).await.is_err());
}

#[tokio::test]
async fn incremental_rebuild_indexes_only_refetched_events() {
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(ScriptedCatalog::new(events()));
    let h = harness(catalog.clone(), temp.path()).await;

    h.rebuilder.trigger(RunMode::Full);
    assert_eq!(h.rebuilder.wait().await.state, RebuildState::Success);
    let previous = h.rebuilder.status().last_watermark.expect("watermark");

    // A local edit after the last run marks the corpus as changed.
    h.store
        .upsert(
            "events",
            NewDocument {
                uid: "2".into(),
                parent_uid: "7".into(),
                created_at: None,
                updated_at: Some(Utc::now() + Duration::hours(1)),
                body: event(2, "Pottery workshop", "pottery clay ceramics workshop kiln"),
            },
        )
        .await
        .expect("upsert");

    catalog.set_events(vec![
        json!({
            "uid": 1,
            "title": {"fr": "Jazz concert"},
            "longDescription": {"fr": "jazz saxophone trumpet concert ".repeat(6)},
            "updatedAt": "2020-01-01T00:00:00Z",
        }),
        event(5, "Jazz jam session", "jazz trombone improvisation jam session"),
    ]);
    h.rebuilder.trigger(RunMode::Incremental);
    let last = h.rebuilder.wait().await;

    assert_eq!(last.state, RebuildState::Success, "{}", last.message);
    assert!(last.last_watermark.expect("watermark") > previous);
    let details = last.details.expect("run details");
    assert_eq!(details.events_filtered_by_date, 1);
    assert_eq!(details.events_processed, 1);

    let events_backup = details
        .backups
        .iter()
        .find(|name| name.starts_with("events_update_"))
        .expect("events backup");
    let stamp = &events_backup["events_update_".len()..];
    assert_eq!(stamp.len(), "YYYYMMDD_HHMMSS".len());
    assert!(chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").is_ok());
    assert!(details.backups.iter().any(|name| name.starts_with("agendas_update_")));
    assert!(
        h.store
            .list_collections()
            .await
            .expect("collections")
            .contains(events_backup)
    );

    let hits = h.rebuilder.search("jazz", 5).await.expect("search");
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.chunk.metadata.uid == "5"));
}

#[tokio::test]
async fn wait_returns_once_the_latest_rebuild_finishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(ScriptedCatalog::gated(events()));
    let h = harness(catalog.clone(), temp.path()).await;

    let first = h.rebuilder.trigger(RunMode::Full);
    let waiter = tokio::spawn({
        let rebuilder = h.rebuilder.clone();
        async move { rebuilder.wait().await }
    });
    catalog.release();
    let done = waiter.await.expect("waiter");
    assert_eq!(done.state, RebuildState::Success, "{}", done.message);
    assert_eq!(done.run_id, first.run_id);

    let second = h.rebuilder.trigger(RunMode::Full);
    assert_ne!(second.run_id, first.run_id);
    let pending = tokio::spawn({
        let rebuilder = h.rebuilder.clone();
        async move { rebuilder.wait().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    catalog.release();
    let last = pending.await.expect("waiter");
    assert_eq!(last.state, RebuildState::Success, "{}", last.message);
    assert_eq!(last.run_id, second.run_id);
}
