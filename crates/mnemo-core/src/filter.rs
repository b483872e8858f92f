//! Shared scope filter
//!
//! The document store, vector index and inverted index all accept the same
//! filter shape: equality on `user_id` / `group_id`, a closed time interval,
//! and the magic value `__all__` that disables a field. The ingest layer
//! never supplies `__all__`; only the retrieval and admin delete paths do.

use serde::{Deserialize, Serialize};

use crate::memory::MAGIC_ALL;

/// Scope filter applied by every store adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeFilter {
    /// Equality on user id; `None` means no filter
    pub user_id: Option<String>,
    /// Equality on group id; `None` means no filter
    pub group_id: Option<String>,
    /// Closed lower bound on timestamp, epoch milliseconds
    pub start_ms: Option<i64>,
    /// Closed upper bound on timestamp, epoch milliseconds
    pub end_ms: Option<i64>,
}

impl ScopeFilter {
    /// Filter on a user only
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Filter on a group only
    pub fn for_group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Default::default()
        }
    }

    /// Normalize a wire value: `None` and `"__all__"` both mean "no filter"
    pub fn normalize(value: Option<&str>) -> Option<String> {
        match value {
            None => None,
            Some(v) if v == MAGIC_ALL || v.is_empty() => None,
            Some(v) => Some(v.to_string()),
        }
    }

    /// Whether any constraint is present
    pub fn is_unbounded(&self) -> bool {
        self.user_id.is_none()
            && self.group_id.is_none()
            && self.start_ms.is_none()
            && self.end_ms.is_none()
    }

    /// Does a record with these scalars pass the filter?
    pub fn matches(&self, user_id: &str, group_id: Option<&str>, timestamp_ms: i64) -> bool {
        if let Some(want) = &self.user_id {
            if want != user_id {
                return false;
            }
        }
        if let Some(want) = &self.group_id {
            if group_id != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.start_ms {
            if timestamp_ms < start {
                return false;
            }
        }
        if let Some(end) = self.end_ms {
            if timestamp_ms > end {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================
