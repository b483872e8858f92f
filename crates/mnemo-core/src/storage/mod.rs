//! Storage layer
//!
//! SQLite document store with versioned migrations. The keyword index shares
//! the database file but is a separate adapter (see [`crate::search`]).

pub mod migrations;
mod sqlite;

pub use sqlite::{DocumentStore, Result, SortOrder, StorageError};
