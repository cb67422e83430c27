//! Repository layer for database access.
//!
//! Each store is an `async_trait` so stage handlers and the queue can be exercised
//! against fakes; the `Sqlx*` types are the SQLite implementations.

pub mod catalog;
pub mod job;
pub mod output;
pub mod transcript;

pub use catalog::*;
pub use job::*;
pub use output::*;
pub use transcript::*;
