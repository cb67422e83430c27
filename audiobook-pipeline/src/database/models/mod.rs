//! Database row models.
//!
//! Ids are UUID strings and timestamps are epoch milliseconds; enum columns are
//! stored as their lowercase names.

pub mod catalog;
pub mod job;
pub mod output;
pub mod transcript;

pub use catalog::*;
pub use job::*;
pub use output::*;
pub use transcript::*;
