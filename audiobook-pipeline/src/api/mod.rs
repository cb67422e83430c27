//! Internal HTTP API.
//!
//! Serves the early summarize trigger, the job status webhook and queue
//! administration. Every route requires the shared internal key.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
