//! audiobook-pipeline library crate.
//!
//! Staged audiobook processing: transcription, summarization, tagging and
//! embedding, coordinated through per-kind priority queues.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
