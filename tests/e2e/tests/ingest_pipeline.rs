//! Ingest pipeline journeys
//!
//! Drives the state machine through full scenarios: boundary detection by
//! time gap, out-of-order rewinds, idempotent redelivery, and hostile
//! oracle output. Asserts the cursor and window-status invariants after
//! every step.

use mnemo_e2e_tests::harness::{message, message_at, TestHarness};
use mnemo_core::{IngestStatus, ScopeFilter, SortOrder, SyncStatus};

/// Six messages: 1-4 on topic A within 90 seconds, 5-6 a day later on a new
/// topic. Posting message 5 must close the episode over messages 1-4.
#[tokio::test]
async fn boundary_by_time_gap_extracts_first_topic() {
    let harness = TestHarness::new();

    let messages = vec![
        message_at("G", "m1", "alice", "2025-02-01T10:00:00Z", "should we switch the build to incremental?"),
        message_at("G", "m2", "bob", "2025-02-01T10:00:30Z", "yes, the cold builds are painful"),
        message_at("G", "m3", "alice", "2025-02-01T10:01:00Z", "ok, I will flip the flag tomorrow"),
        message_at("G", "m4", "bob", "2025-02-01T10:01:30Z", "thanks, ping me when it lands"),
    ];
    for msg in &messages {
        let outcome = harness.engine.memorize(msg.clone()).await.unwrap();
        assert_eq!(outcome.status, IngestStatus::Accumulated);
        assert_eq!(outcome.count, 0);
    }

    // a day later the topic changes; the oracle closes the episode at m4
    harness.oracle.push_boundary(3, "build switched to incremental");
    let msg5 = message_at("G", "m5", "alice", "2025-02-02T10:00:00Z", "lunch today?");
    let outcome = harness.engine.memorize(msg5).await.unwrap();
    assert_eq!(outcome.status, IngestStatus::Extracted);
    assert!(outcome.count >= 1);

    // exactly one MemCell whose original_data is messages 1-4
    let (cells, total) = harness
        .engine
        .fetch_memories(&ScopeFilter::for_group("G"), SortOrder::Asc, 100, 0)
        .unwrap();
    assert_eq!(total, 1);
    let cell = &cells[0];
    let covered: Vec<&str> = cell
        .original_data
        .iter()
        .map(|m| m.message_id.as_str())
        .collect();
    assert_eq!(covered, vec!["m1", "m2", "m3", "m4"]);
    assert_eq!(cell.summary.as_deref(), Some("build switched to incremental"));
    assert_eq!(cell.timestamp.to_rfc3339(), "2025-02-01T10:01:30+00:00");

    // P4: every covered message is consumed, the trigger message is not
    let store = harness.engine.store();
    for id in ["m1", "m2", "m3", "m4"] {
        assert_eq!(store.message_status("G", id).unwrap(), Some(SyncStatus::Consumed));
    }
    assert_ne!(store.message_status("G", "m5").unwrap(), Some(SyncStatus::Consumed));

    // message 6 keeps accumulating on the new topic
    let msg6 = message_at("G", "m6", "bob", "2025-02-02T10:00:30Z", "sure, noon?");
    let outcome = harness.engine.memorize(msg6).await.unwrap();
    assert_eq!(outcome.status, IngestStatus::Accumulated);
}

/// P1: resubmitting any `(group_id, message_id)` is a no-op on the final
/// cursor and the set of MemCells.
#[tokio::test]
async fn redelivery_is_idempotent() {
    let harness = TestHarness::new();

    for (id, secs, text) in [("m1", 100, "planning the offsite"), ("m2", 160, "vote for the venue")] {
        harness
            .engine
            .memorize(message("G", id, "alice", secs, text))
            .await
            .unwrap();
    }
    harness.oracle.push_boundary(1, "offsite planned");
    harness
        .engine
        .memorize(message("G", "m3", "alice", 9000, "new topic"))
        .await
        .unwrap();

    let status_before = harness.engine.store().get_status("G").unwrap().unwrap();
    let (cells_before, _) = harness
        .engine
        .fetch_memories(&ScopeFilter::for_group("G"), SortOrder::Asc, 100, 0)
        .unwrap();
    let ids_before: Vec<String> = cells_before.iter().map(|c| c.event_id.clone()).collect();

    // replay a consumed message and an unconsumed one, several times
    for _ in 0..3 {
        for (id, secs, text) in [
            ("m1", 100, "planning the offsite"),
            ("m3", 9000, "new topic"),
        ] {
            let outcome = harness
                .engine
                .memorize(message("G", id, "alice", secs, text))
                .await
                .unwrap();
            assert_eq!(outcome.status, IngestStatus::Accumulated);
        }
    }

    let status_after = harness.engine.store().get_status("G").unwrap().unwrap();
    let (cells_after, _) = harness
        .engine
        .fetch_memories(&ScopeFilter::for_group("G"), SortOrder::Asc, 100, 0)
        .unwrap();
    let ids_after: Vec<String> = cells_after.iter().map(|c| c.event_id.clone()).collect();
    assert_eq!(ids_before, ids_after);
    assert_eq!(
        status_before.old_msg_start_time,
        status_after.old_msg_start_time
    );
    assert_eq!(
        status_before.new_msg_start_time,
        status_after.new_msg_start_time
    );
    assert_eq!(
        status_before.last_memcell_time,
        status_after.last_memcell_time
    );
    assert_eq!(
        harness.engine.store().message_status("G", "m1").unwrap(),
        Some(SyncStatus::Consumed)
    );
}

/// Scenario 2: a message older than the pending window rewinds the cursor.
#[tokio::test]
async fn out_of_order_arrival_rewinds_cursor() {
    let harness = TestHarness::new();

    harness
        .engine
        .memorize(message("G2", "late-100", "alice", 100, "first seen"))
        .await
        .unwrap();
    harness
        .engine
        .memorize(message("G2", "late-50", "alice", 50, "sent earlier, delivered later"))
        .await
        .unwrap();

    let status = harness.engine.store().get_status("G2").unwrap().unwrap();
    assert!(status.new_msg_start_time.timestamp() <= 50);
    assert!(status.old_msg_start_time <= status.new_msg_start_time);
}

/// P3: in-order ingest never moves any cursor component backwards.
#[tokio::test]
async fn cursor_is_monotone_across_ingests() {
    let harness = TestHarness::new();
    let mut previous = None;

    for i in 0..6 {
        if i == 3 {
            harness.oracle.push_boundary(2, "early episode");
        }
        harness
            .engine
            .memorize(message("G3", &format!("m{i}"), "alice", 100 + i * 60, "chatter"))
            .await
            .unwrap();

        let status = harness.engine.store().get_status("G3").unwrap().unwrap();
        if let Some(prev) = previous {
            let prev: mnemo_core::ConversationStatus = prev;
            assert!(status.old_msg_start_time >= prev.old_msg_start_time);
            assert!(status.new_msg_start_time >= prev.new_msg_start_time);
            assert!(status.last_memcell_time >= prev.last_memcell_time);
        }
        assert!(status.old_msg_start_time <= status.new_msg_start_time);
        previous = Some(status);
    }
}

/// Any oracle output (malformed JSON, wait signals, absurd indices) keeps
/// the state machine inside its invariants.
#[tokio::test]
async fn hostile_oracle_output_cannot_corrupt_state() {
    let harness = TestHarness::new();

    let hostile = [
        "not json at all {{{",
        r#"{"boundary": "yes"}"#,
        r#"{"wait": true}"#,
        r#"{"boundary": true, "boundary_index": 9999, "summary": "x"}"#,
        r#"{"boundary": true}"#,
    ];
    for (i, response) in hostile.iter().enumerate() {
        // unparseable output is retried once within the same call
        harness.oracle.push_boundary_raw(response);
        harness.oracle.push_boundary_raw(response);
        let outcome = harness
            .engine
            .memorize(message("G4", &format!("m{i}"), "alice", 100 + i as i64, "payload"))
            .await
            .unwrap();
        assert_eq!(outcome.status, IngestStatus::Accumulated);
    }

    // no cell extracted, cursor still ordered, nothing consumed
    let (_, total) = harness
        .engine
        .fetch_memories(&ScopeFilter::for_group("G4"), SortOrder::Asc, 100, 0)
        .unwrap();
    assert_eq!(total, 0);
    let status = harness.engine.store().get_status("G4").unwrap().unwrap();
    assert!(status.old_msg_start_time <= status.new_msg_start_time);
    for i in 0..hostile.len() {
        assert_ne!(
            harness
                .engine
                .store()
                .message_status("G4", &format!("m{i}"))
                .unwrap(),
            Some(SyncStatus::Consumed)
        );
    }
}
