//! HTTP boundary for rebuild control and semantic search.
//!
//! Pipeline failures never surface as HTTP errors here; they are reported
//! through the rebuild status payload.

mod rebuild;
mod search;
mod server;
mod state;

pub use server::{router, serve_on, start_http_server};
pub use state::ApiState;
