//! Shared state for the HTTP API.

use crate::rebuild::Rebuilder;
use std::sync::Arc;
use std::time::Instant;

/// State shared across all API handlers.
pub struct ApiState {
    pub started_at: Instant,
    pub rebuilder: Arc<Rebuilder>,
    /// Result count when a search request does not name one.
    pub default_k: usize,
}

impl ApiState {
    pub fn new(rebuilder: Arc<Rebuilder>, default_k: usize) -> Self {
        Self {
            started_at: Instant::now(),
            rebuilder,
            default_k,
        }
    }
}
