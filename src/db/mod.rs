//! Database module for turnwatch.
//!
//! Provides SQLite storage for device records with an embedded migration.

mod models;
mod store;

pub use models::*;
pub use store::*;
