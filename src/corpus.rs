//! Event corpus: upstream catalog, document store, run history and the
//! maintenance steps applied before indexing.

pub mod archive;
pub mod catalog;
pub mod curation;
pub mod dedup;
pub mod ingest;
pub mod models;
pub mod runs;
pub mod store;

pub use archive::{ArchiveOutcome, BackupInfo, BackupKind, DeleteReport};
pub use catalog::{CatalogPage, CatalogSource, HttpCatalog};
pub use ingest::IngestStats;
pub use models::{AgendaRecord, EventRecord};
pub use runs::{RunLog, RunMode, RunRecord};
pub use store::{Document, DocumentStore, NewDocument, SqliteStore};
