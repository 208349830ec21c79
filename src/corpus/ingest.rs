//! Paginated upstream fetch into the document store.

use crate::corpus::catalog::{AgendaQuery, CatalogSource, EventQuery};
use crate::corpus::models::{AgendaRecord, EventRecord};
use crate::corpus::store::{DocumentStore, NewDocument, UpsertOutcome};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Payloads that failed validation and were never stored.
    pub rejected: u64,
    /// Events older than the watermark, skipped by the date filter.
    pub filtered_by_date: u64,
    /// Agendas whose event pagination was abandoned after an upstream error.
    pub failed_agendas: u64,
    /// Whether the agenda listing itself stopped early on an upstream error.
    pub listing_interrupted: bool,
}

impl IngestStats {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }
}

/// Page through agendas updated since `since`, upserting each by uid.
///
/// An upstream error stops the listing; agendas already stored are kept.
pub async fn fetch_agendas(
    catalog: &dyn CatalogSource,
    store: &dyn DocumentStore,
    collection: &str,
    since: DateTime<Utc>,
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    let mut query = AgendaQuery {
        updated_since: since,
        after: None,
    };

    loop {
        let page = match catalog.fetch_agendas(&query).await {
            Ok(page) => page,
            Err(error) => {
                tracing::error!(%error, "agenda listing failed, keeping agendas fetched so far");
                stats.listing_interrupted = true;
                break;
            }
        };

        for item in &page.items {
            stats.fetched += 1;
            let agenda = match AgendaRecord::from_value(item) {
                Ok(agenda) => agenda,
                Err(reason) => {
                    tracing::warn!(%reason, "rejecting agenda payload");
                    stats.rejected += 1;
                    continue;
                }
            };
            let document = NewDocument {
                uid: agenda.uid.clone(),
                parent_uid: String::new(),
                created_at: None,
                updated_at: agenda.updated_at,
                body: agenda.to_value(),
            };
            stats.record(store.upsert(collection, document).await?);
        }

        match page.after {
            Some(after) if !page.items.is_empty() => query.after = Some(after),
            _ => break,
        }
    }

    tracing::info!(
        fetched = stats.fetched,
        inserted = stats.inserted,
        updated = stats.updated,
        rejected = stats.rejected,
        "agendas fetched"
    );
    Ok(stats)
}

/// For every stored agenda, page through its events and upsert them keyed by
/// `(uid, agenda uid)`.
///
/// With `date_filter` set, only events created or updated at or after that
/// instant are stored. An upstream error abandons the current agenda and
/// moves on to the next.
pub async fn fetch_events(
    catalog: &dyn CatalogSource,
    store: &dyn DocumentStore,
    agendas_collection: &str,
    events_collection: &str,
    date_filter: Option<DateTime<Utc>>,
) -> Result<IngestStats> {
    let agenda_uids: BTreeSet<String> = store
        .find(agendas_collection)
        .await?
        .into_iter()
        .map(|document| document.uid)
        .collect();

    if agenda_uids.is_empty() {
        tracing::warn!(collection = agendas_collection, "no agendas stored, nothing to fetch");
    }

    let mut stats = IngestStats::default();
    for agenda_uid in &agenda_uids {
        let mut query = EventQuery::default();
        let mut agenda_events = 0_u64;

        loop {
            let page = match catalog.fetch_events(agenda_uid, &query).await {
                Ok(page) => page,
                Err(error) => {
                    tracing::error!(%error, agenda = %agenda_uid, "event fetch failed, skipping to next agenda");
                    stats.failed_agendas += 1;
                    break;
                }
            };

            for item in &page.items {
                stats.fetched += 1;
                agenda_events += 1;
                let event = match EventRecord::from_value(item, Some(agenda_uid)) {
                    Ok(event) => event,
                    Err(reason) => {
                        tracing::warn!(%reason, agenda = %agenda_uid, "rejecting event payload");
                        stats.rejected += 1;
                        continue;
                    }
                };

                if let Some(watermark) = date_filter
                    && !event.changed_since(watermark)
                {
                    stats.filtered_by_date += 1;
                    continue;
                }

                let document = NewDocument {
                    uid: event.uid.clone(),
                    parent_uid: event.agenda_uid.clone(),
                    created_at: event.created_at,
                    updated_at: event.updated_at,
                    body: event.to_value(),
                };
                stats.record(store.upsert(events_collection, document).await?);
            }

            match page.after {
                Some(after) if !page.items.is_empty() => query.after = Some(after),
                _ => break,
            }
        }

        tracing::debug!(agenda = %agenda_uid, events = agenda_events, "agenda events fetched");
    }

    tracing::info!(
        agendas = agenda_uids.len(),
        fetched = stats.fetched,
        inserted = stats.inserted,
        updated = stats.updated,
        rejected = stats.rejected,
        filtered_by_date = stats.filtered_by_date,
        failed_agendas = stats.failed_agendas,
        "events fetched"
    );
    Ok(stats)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::corpus::catalog::{AgendaQuery, CatalogPage, CatalogSource, EventQuery};
    use crate::error::{CatalogError, Result};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Catalog serving fixed pages. Each agenda's events are split into
    /// pages of `page_size`; the cursor is the index of the next page.
    #[derive(Default)]
    pub(crate) struct StaticCatalog {
        pub(crate) agendas: Vec<Value>,
        pub(crate) events: HashMap<String, Vec<Value>>,
        pub(crate) failing: Vec<String>,
        pub(crate) page_size: usize,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    fn page(items: &[Value], after: &Option<Vec<Value>>, size: usize) -> CatalogPage {
        let index = after
            .as_ref()
            .and_then(|a| a.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let size = size.max(1);
        let start = (index * size).min(items.len());
        let end = (start + size).min(items.len());
        CatalogPage {
            items: items[start..end].to_vec(),
            after: (end < items.len()).then(|| vec![json!(index + 1)]),
        }
    }

    #[async_trait]
    impl CatalogSource for StaticCatalog {
        async fn fetch_agendas(&self, query: &AgendaQuery) -> Result<CatalogPage> {
            self.requests
                .lock()
                .expect("lock")
                .push("agendas".to_string());
            Ok(page(&self.agendas, &query.after, self.page_size))
        }

        async fn fetch_events(&self, agenda_uid: &str, query: &EventQuery) -> Result<CatalogPage> {
            self.requests
                .lock()
                .expect("lock")
                .push(agenda_uid.to_string());
            if self.failing.iter().any(|uid| uid == agenda_uid) {
                return Err(CatalogError::Status {
                    status: 503,
                    url: format!("/agendas/{agenda_uid}/events"),
                }
                .into());
            }
            let events = self.events.get(agenda_uid).cloned().unwrap_or_default();
            Ok(page(&events, &query.after, self.page_size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StaticCatalog;
    use super::{fetch_agendas, fetch_events};
    use crate::corpus::store::{DocumentStore, SqliteStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::HashMap;

    fn catalog() -> StaticCatalog {
        let mut events = HashMap::new();
        events.insert(
            "1".to_string(),
            vec![
                json!({"uid": "e1", "updatedAt": "2024-06-01T00:00:00Z"}),
                json!({"uid": "e2", "updatedAt": "2023-01-01T00:00:00Z"}),
                json!({"title": "no uid"}),
            ],
        );
        events.insert(
            "3".to_string(),
            vec![json!({"uid": "e1", "createdAt": "2024-07-01T00:00:00Z"})],
        );
        StaticCatalog {
            agendas: vec![json!({"uid": 1}), json!({"uid": 2}), json!({"uid": 3})],
            events,
            failing: vec!["2".to_string()],
            page_size: 2,
            ..StaticCatalog::default()
        }
    }

    #[tokio::test]
    async fn ingests_paginated_catalog() {
        let store = SqliteStore::in_memory().await.expect("store");
        let catalog = catalog();
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let agendas = fetch_agendas(&catalog, &store, "agendas", since)
            .await
            .expect("agendas");
        assert_eq!(agendas.inserted, 3);

        let events = fetch_events(&catalog, &store, "agendas", "events", None)
            .await
            .expect("events");
        assert_eq!(events.fetched, 4);
        assert_eq!(events.inserted, 3);
        assert_eq!(events.rejected, 1);
        assert_eq!(events.failed_agendas, 1);
        assert_eq!(store.count("events").await.expect("count"), 3);

        // A second pass over the same pages only updates.
        let again = fetch_events(&catalog, &store, "agendas", "events", None)
            .await
            .expect("events");
        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 3);
        assert_eq!(store.count("events").await.expect("count"), 3);
    }

    #[tokio::test]
    async fn date_filter_skips_stale_events() {
        let store = SqliteStore::in_memory().await.expect("store");
        let catalog = catalog();
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        fetch_agendas(&catalog, &store, "agendas", since)
            .await
            .expect("agendas");
        let events = fetch_events(&catalog, &store, "agendas", "events", Some(since))
            .await
            .expect("events");

        assert_eq!(events.filtered_by_date, 1);
        assert_eq!(events.inserted, 2);
    }
}
