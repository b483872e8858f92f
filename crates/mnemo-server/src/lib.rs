//! Mnemo HTTP server
//!
//! Axum service exposing the memory engine: message ingest, fetch, search,
//! soft delete, conversation metadata and custom profiles. The binary in
//! `main.rs` wires configuration and serving; this library exposes the
//! router so integration tests drive it in-process.

pub mod api;
pub mod state;

pub use api::router;
pub use state::AppState;
