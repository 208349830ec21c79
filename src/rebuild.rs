//! Rebuild orchestration: the pipeline steps, the background task that runs
//! them, and the status it publishes.

pub mod orchestrator;
pub mod pipeline;
pub mod status;

pub use orchestrator::Rebuilder;
pub use pipeline::{Pipeline, PipelineSettings, RunOutcome};
pub use status::{RebuildState, RebuildStatus, RunSummary};
