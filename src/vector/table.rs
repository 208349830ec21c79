//! LanceDB table holding the persisted chunk vectors.

use crate::chunks::{Chunk, ChunkMetadata};
use crate::error::{DbError, Result};
use crate::vector::index::IndexEntry;
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, ArrayRef, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray};
use futures::TryStreamExt;
use std::sync::Arc;

pub(crate) const TABLE_NAME: &str = "chunks";

/// Rows per record batch when writing.
const WRITE_BATCH_ROWS: usize = 1024;

/// Chunk vectors table with a fixed embedding width.
pub struct ChunkTable {
    table: lancedb::Table,
    dimension: usize,
}

impl ChunkTable {
    /// Create the table and write all entries.
    pub async fn create(
        connection: &lancedb::Connection,
        dimension: usize,
        entries: &[IndexEntry],
    ) -> Result<Self> {
        let schema = Arc::new(schema(dimension));

        let mut batches = Vec::new();
        for slice in entries.chunks(WRITE_BATCH_ROWS) {
            batches.push(Ok(record_batch(schema.clone(), dimension, slice)?));
        }
        let reader = RecordBatchIterator::new(batches, schema.clone());

        let table = connection
            .create_table(TABLE_NAME, Box::new(reader))
            .execute()
            .await
            .map_err(|e| DbError::LanceDb(e.to_string()))?;

        Ok(Self { table, dimension })
    }

    pub async fn open(connection: &lancedb::Connection, dimension: usize) -> Result<Self> {
        let table = connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| DbError::LanceDb(e.to_string()))?;
        Ok(Self { table, dimension })
    }

    pub async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| DbError::LanceDb(e.to_string()).into())
    }

    /// Read every row back. Rows with a malformed embedding or metadata are
    /// an error, not silently skipped.
    pub async fn read_all(&self) -> Result<Vec<IndexEntry>> {
        use lancedb::query::ExecutableQuery;

        let results: Vec<RecordBatch> = self
            .table
            .query()
            .execute()
            .await
            .map_err(|e| DbError::LanceDb(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| DbError::LanceDb(e.to_string()))?;

        let mut entries = Vec::new();
        for batch in results {
            let (Some(id_col), Some(text_col), Some(metadata_col), Some(embedding_col)) = (
                batch.column_by_name("chunk_id"),
                batch.column_by_name("text"),
                batch.column_by_name("metadata"),
                batch.column_by_name("embedding"),
            ) else {
                return Err(DbError::LanceDb("chunks table is missing columns".into()).into());
            };

            let ids: &StringArray = id_col.as_string::<i32>();
            let texts: &StringArray = text_col.as_string::<i32>();
            let metadata: &StringArray = metadata_col.as_string::<i32>();
            let embeddings: &FixedSizeListArray = embedding_col.as_fixed_size_list();

            for row in 0..batch.num_rows() {
                if !ids.is_valid(row) || !embeddings.is_valid(row) {
                    return Err(DbError::LanceDb(format!("null value in chunks row {row}")).into());
                }
                let values = embeddings.value(row);
                let embedding = values.as_primitive::<Float32Type>().values().to_vec();
                if embedding.len() != self.dimension {
                    return Err(DbError::LanceDb(format!(
                        "row {row} has {} dimensions, expected {}",
                        embedding.len(),
                        self.dimension
                    ))
                    .into());
                }
                let metadata: ChunkMetadata =
                    serde_json::from_str(metadata.value(row)).map_err(DbError::from)?;

                entries.push(IndexEntry {
                    chunk: Chunk {
                        id: ids.value(row).to_string(),
                        text: texts.value(row).to_string(),
                        metadata,
                    },
                    embedding,
                });
            }
        }

        Ok(entries)
    }
}

fn record_batch(
    schema: Arc<arrow_schema::Schema>,
    dimension: usize,
    entries: &[IndexEntry],
) -> Result<RecordBatch> {
    let ids = StringArray::from_iter_values(entries.iter().map(|e| e.chunk.id.as_str()));
    let texts = StringArray::from_iter_values(entries.iter().map(|e| e.chunk.text.as_str()));
    let metadata = entries
        .iter()
        .map(|e| serde_json::to_string(&e.chunk.metadata))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DbError::from)?;
    let metadata = StringArray::from(metadata);

    let embeddings = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        entries
            .iter()
            .map(|e| Some(e.embedding.iter().map(|v| Some(*v)).collect::<Vec<_>>())),
        dimension as i32,
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids) as ArrayRef,
            Arc::new(texts) as ArrayRef,
            Arc::new(metadata) as ArrayRef,
            Arc::new(embeddings) as ArrayRef,
        ],
    )
    .map_err(|e| DbError::LanceDb(e.to_string()).into())
}

fn schema(dimension: usize) -> arrow_schema::Schema {
    arrow_schema::Schema::new(vec![
        arrow_schema::Field::new("chunk_id", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new("text", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new("metadata", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new(
            "embedding",
            arrow_schema::DataType::FixedSizeList(
                Arc::new(arrow_schema::Field::new(
                    "item",
                    arrow_schema::DataType::Float32,
                    true,
                )),
                dimension as i32,
            ),
            false,
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::ChunkTable;
    use crate::chunks::{Chunk, ChunkMetadata};
    use crate::vector::index::IndexEntry;

    #[tokio::test]
    async fn rows_survive_write_and_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let connection = lancedb::connect(temp.path().to_str().expect("path utf8"))
            .execute()
            .await
            .expect("connect lancedb");

        let entries: Vec<IndexEntry> = (0..3)
            .map(|i| IndexEntry {
                chunk: Chunk {
                    id: format!("e{i}:a:0"),
                    text: format!("chunk {i}"),
                    metadata: ChunkMetadata {
                        uid: format!("e{i}"),
                        city: Some("Nîmes".into()),
                        ..ChunkMetadata::default()
                    },
                },
                embedding: vec![i as f32, 1.0, 0.5],
            })
            .collect();

        let table = ChunkTable::create(&connection, 3, &entries)
            .await
            .expect("create table");
        assert_eq!(table.count().await.expect("count"), 3);

        let reopened = ChunkTable::open(&connection, 3).await.expect("open");
        let mut read = reopened.read_all().await.expect("read");
        read.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
        assert_eq!(read, entries);
    }
}
