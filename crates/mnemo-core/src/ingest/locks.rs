//! Per-group lock table
//!
//! Single-writer-per-group mutual exclusion for ingest. The table hands out
//! `Arc<tokio::sync::Mutex<()>>` per group key so the lock can be held
//! across the suspension points of the critical section (providers, stores).
//! Cross-group ingests stay independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Sharded-by-key async lock table
#[derive(Default)]
pub struct GroupLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for a group, created on first use
    pub fn lock_for(&self, group_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================
