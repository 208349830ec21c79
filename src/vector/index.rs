//! In-memory flat vector index over chunks.

use crate::chunks::Chunk;
use crate::embedding::{EncodeRole, Encoder};
use crate::error::{EmbeddingError, IndexError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// One embedding bound to the chunk it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Chunk,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub dimension: usize,
}

/// Exact nearest-neighbour index, built fully in memory and replaced as a
/// unit.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    model_id: String,
    created_at: DateTime<Utc>,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Assemble an index from precomputed entries, checking every width.
    pub fn from_entries(
        dimension: usize,
        model_id: impl Into<String>,
        created_at: DateTime<Utc>,
        entries: Vec<IndexEntry>,
    ) -> Result<Self> {
        if let Some(entry) = entries.iter().find(|e| e.embedding.len() != dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                found: entry.embedding.len(),
            }
            .into());
        }
        Ok(Self {
            dimension,
            model_id: model_id.into(),
            created_at,
            entries,
        })
    }

    /// Encode every chunk as a passage. Zero chunks is an error.
    pub fn build(chunks: Vec<Chunk>, encoder: &Encoder) -> Result<Self> {
        if chunks.is_empty() {
            return Err(IndexError::Empty.into());
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = encoder.encode(&texts, EncodeRole::Passage)?;
        if embeddings.len() != chunks.len() {
            return Err(EmbeddingError::Inference(format!(
                "encoder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            ))
            .into());
        }

        let entries = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry { chunk, embedding })
            .collect();

        Self::from_entries(encoder.dimension(), encoder.model_id(), Utc::now(), entries)
    }

    /// [`VectorIndex::build`] on the blocking pool.
    pub async fn build_async(chunks: Vec<Chunk>, encoder: Arc<Encoder>) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::build(chunks, &encoder))
            .await
            .map_err(|e| EmbeddingError::Task(e.to_string()))?
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            count: self.entries.len(),
            dimension: self.dimension,
        }
    }

    /// The `k` nearest chunks by squared L2 distance, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                index: self.dimension,
                encoder: query.len(),
            }
            .into());
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (position, squared_l2(query, &entry.embedding)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, distance)| SearchHit {
                chunk: self.entries[position].chunk.clone(),
                distance,
            })
            .collect())
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::{IndexEntry, VectorIndex};
    use crate::chunks::{Chunk, ChunkMetadata};
    use crate::embedding::test_support::CharEncoder;
    use crate::embedding::Encoder;
    use chrono::Utc;
    use std::sync::Arc;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            text: text.into(),
            metadata: ChunkMetadata {
                uid: id.into(),
                ..ChunkMetadata::default()
            },
        }
    }

    #[test]
    fn empty_build_is_rejected() {
        let encoder = Encoder::new(Arc::new(CharEncoder::new(4)), "char", 8);
        let error = VectorIndex::build(Vec::new(), &encoder).expect_err("empty build");
        assert!(error.to_string().contains("empty index"));
    }

    #[test]
    fn search_orders_by_distance() {
        let entries = vec![
            IndexEntry { chunk: chunk("far", "far"), embedding: vec![0.0, 1.0] },
            IndexEntry { chunk: chunk("near", "near"), embedding: vec![1.0, 0.0] },
            IndexEntry { chunk: chunk("mid", "mid"), embedding: vec![0.6, 0.8] },
        ];
        let index = VectorIndex::from_entries(2, "test", Utc::now(), entries).expect("index");

        let hits = index.search(&[1.0, 0.0], 2).expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "near");
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[1].chunk.id, "mid");
        assert!((hits[1].distance - 0.8).abs() < 1e-6);
    }

    #[test]
    fn query_width_must_match() {
        let entries = vec![IndexEntry { chunk: chunk("a", "a"), embedding: vec![1.0, 0.0] }];
        let index = VectorIndex::from_entries(2, "test", Utc::now(), entries).expect("index");
        assert!(index.search(&[1.0, 0.0, 0.0], 1).is_err());
    }

    #[test]
    fn build_binds_each_chunk_to_its_vector() {
        let encoder = Encoder::new(Arc::new(CharEncoder::new(4)), "char", 2);
        let chunks = vec![chunk("a", "concert"), chunk("b", "exposition"), chunk("c", "atelier")];
        let index = VectorIndex::build(chunks, &encoder).expect("build");

        assert_eq!(index.stats().count, 3);
        assert_eq!(index.stats().dimension, 4);
        let query = encoder
            .encode(&["exposition".to_string()], crate::embedding::EncodeRole::Passage)
            .expect("encode");
        let hits = index.search(&query[0], 1).expect("search");
        assert_eq!(hits[0].chunk.id, "b");
        assert!(hits[0].distance < 1e-6);
    }
}
