//! Duplicate event removal.

use crate::corpus::store::{Document, DocumentStore};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub groups: u64,
    pub deleted: u64,
}

/// Pick the member to keep: greatest `updated_at` (missing sorts oldest),
/// ties go to the earliest stored document.
fn survivor(group: &[Document]) -> Option<i64> {
    group
        .iter()
        .max_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| b.doc_id.cmp(&a.doc_id))
        })
        .map(|document| document.doc_id)
}

/// Collapse every group of events sharing a uid down to one document.
pub async fn deduplicate(store: &dyn DocumentStore, collection: &str) -> Result<DedupStats> {
    let groups = store.duplicate_groups(collection).await?;
    let mut stats = DedupStats {
        groups: groups.len() as u64,
        deleted: 0,
    };

    let mut doomed = Vec::new();
    for group in &groups {
        let Some(keep) = survivor(group) else {
            continue;
        };
        doomed.extend(
            group
                .iter()
                .map(|document| document.doc_id)
                .filter(|doc_id| *doc_id != keep),
        );
    }

    if !doomed.is_empty() {
        stats.deleted = store.delete_ids(collection, &doomed).await?;
    }

    tracing::info!(groups = stats.groups, deleted = stats.deleted, "duplicates removed");
    Ok(stats)
}
