//! Service wiring and lifecycle.

pub mod container;

pub use container::{Providers, ServiceContainer};
