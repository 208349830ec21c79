//! Event corpus sync and vector index rebuild.
//!
//! Pulls cultural events from an upstream catalog into a local document
//! store, cleans them, cuts them into overlapping chunks, embeds the chunks
//! and serves nearest-neighbour search over the result while rebuilds run in
//! the background.

pub mod api;
pub mod chunks;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod rebuild;
pub mod telemetry;
pub mod vector;

pub use error::{Error, Result};
