//! Removal of events too thin to be worth indexing.

use crate::corpus::models::EventRecord;
use crate::corpus::store::DocumentStore;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurationStats {
    pub without_description: u64,
    pub short_description: u64,
    pub deleted: u64,
}

/// Delete events whose long description is missing, empty, or shorter than
/// `min_chars` characters.
pub async fn remove_thin_events(
    store: &dyn DocumentStore,
    collection: &str,
    min_chars: usize,
) -> Result<CurationStats> {
    let mut stats = CurationStats::default();
    let mut doomed = Vec::new();

    for document in store.find(collection).await? {
        let description = EventRecord::from_value(&document.body, None)
            .ok()
            .and_then(|event| event.long_description);

        match description {
            None => stats.without_description += 1,
            Some(text) if text.is_empty() => stats.without_description += 1,
            Some(text) if text.chars().count() < min_chars => stats.short_description += 1,
            Some(_) => continue,
        }
        doomed.push(document.doc_id);
    }

    if !doomed.is_empty() {
        stats.deleted = store.delete_ids(collection, &doomed).await?;
    }

    tracing::info!(
        without_description = stats.without_description,
        short_description = stats.short_description,
        deleted = stats.deleted,
        min_chars,
        "thin events removed"
    );
    Ok(stats)
}
