//! Shared application state

use std::sync::Arc;

use mnemo_core::MemoryEngine;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// The assembled memory engine
    pub engine: Arc<MemoryEngine>,
}

impl AppState {
    /// Wrap an engine
    pub fn new(engine: MemoryEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}
