//! Subsync Shared Types and Utilities
//!
//! Storage abstractions, errors, and common types shared across the Subsync crates.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;
pub mod error;
pub mod repository;
pub mod shutdown;
pub mod telemetry;
pub mod types;

pub use db::*;
pub use error::*;
pub use repository::{Entity, FieldValue, InMemoryRepository, Repository, Scope};
pub use shutdown::shutdown_signal;
pub use telemetry::init_tracing;
pub use types::*;
