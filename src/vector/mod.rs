//! Vector index over event chunks.
//!
//! The index is built entirely in memory from chunk embeddings, persisted as
//! a LanceDB dataset with a JSON manifest, and searched with exact squared
//! L2 distance.

pub mod index;
pub mod store;
pub mod table;

pub use index::{IndexEntry, IndexStats, SearchHit, VectorIndex};
pub use store::{DiskLoader, IndexLoader, IndexStore, Manifest};
pub use table::ChunkTable;
