//! Per-group conversation cursor
//!
//! [`ConversationStatus`] is the state-machine cursor that partitions a
//! group's window log into history context and pending-new messages. All four
//! timestamps are non-decreasing across successful ingests of the same group.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Per-group state machine cursor.
///
/// Entries with `create_time ∈ [old_msg_start_time, new_msg_start_time)` are
/// history context; entries in `[new_msg_start_time, now]` are pending-new.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStatus {
    /// Group the cursor belongs to (`""` for the default group)
    pub group_id: String,
    /// Lower bound of the history window (inclusive)
    pub old_msg_start_time: DateTime<Utc>,
    /// Split point between history and pending-new (exclusive upper for history)
    pub new_msg_start_time: DateTime<Utc>,
    /// Timestamp of the last extracted MemCell
    pub last_memcell_time: DateTime<Utc>,
    /// Last time the cursor moved
    pub updated_at: DateTime<Utc>,
}

impl ConversationStatus {
    /// Cursor for a group seen for the first time: both window bounds start
    /// at the first message's timestamp.
    pub fn new_conversation(group_id: impl Into<String>, first_message_time: DateTime<Utc>) -> Self {
        Self {
            group_id: group_id.into(),
            old_msg_start_time: first_message_time,
            new_msg_start_time: first_message_time,
            last_memcell_time: first_message_time,
            updated_at: Utc::now(),
        }
    }

    /// Rewind for an out-of-order arrival: pull `new_msg_start_time` back to
    /// the earliest unconsumed message and keep the history bound strictly
    /// below it.
    pub fn rewind_to(&mut self, earliest_new: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if earliest_new >= self.new_msg_start_time {
            return false;
        }
        self.new_msg_start_time = earliest_new;
        let boundary = earliest_new - Duration::milliseconds(1);
        if boundary < self.old_msg_start_time {
            self.old_msg_start_time = boundary;
        }
        self.updated_at = now;
        true
    }

    /// Advance after a no-boundary decision: the pending messages join the
    /// window but stay unconsumed.
    pub fn accumulate_to(&mut self, latest_new: DateTime<Utc>, now: DateTime<Utc>) {
        if latest_new > self.new_msg_start_time {
            self.new_msg_start_time = latest_new;
        }
        self.updated_at = now;
    }

    /// Advance after a successful extraction covering messages up to
    /// `last_covered`: both window bounds move past the covered range.
    pub fn advance_after_extraction(
        &mut self,
        last_covered: DateTime<Utc>,
        memcell_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let next = last_covered + Duration::milliseconds(1);
        if last_covered > self.old_msg_start_time {
            self.old_msg_start_time = last_covered;
        }
        if next > self.new_msg_start_time {
            self.new_msg_start_time = next;
        }
        if memcell_time > self.last_memcell_time {
            self.last_memcell_time = memcell_time;
        }
        self.updated_at = now;
    }
}

// ============================================================================
// TESTS
// ============================================================================
