//! Fan-out journeys
//!
//! One MemCell with an episode, two semantic memories and a three-fact
//! event log must land as exactly six records in the vector index and six
//! in the inverted index, all sharing the parent id.

use mnemo_e2e_tests::harness::{message, TestHarness};
use mnemo_core::{parse_child_record_id, IngestStatus, RecordKind, RetrieveMethod, RetrieveRequest};

async fn extract_rich_cell(harness: &TestHarness) -> String {
    harness
        .oracle
        .set_episode("Alice and Bob compared espresso preferences and planned the offsite.");
    harness.oracle.set_semantic(
        r#"[
            {"content": "Alice prefers espresso over filter coffee", "evidence": "said so"},
            {"content": "Bob is organising the offsite in March",
             "start_time": "2025-03-01", "end_time": "2025-03-31"}
        ]"#,
    );
    harness.oracle.set_eventlog(
        r#"{"time": null, "atomic_fact": [
            "Alice ordered an espresso",
            "Bob booked the venue",
            "Alice agreed to send the invite"
        ]}"#,
    );

    harness
        .engine
        .memorize(message("G", "m1", "alice", 100, "espresso or filter?"))
        .await
        .unwrap();
    harness.oracle.push_boundary(0, "coffee preferences settled");
    let outcome = harness
        .engine
        .memorize(message("G", "m2", "bob", 9000, "fresh topic"))
        .await
        .unwrap();
    assert_eq!(outcome.status, IngestStatus::Extracted);

    let (cells, _) = harness
        .engine
        .fetch_memories(
            &mnemo_core::ScopeFilter::for_group("G"),
            mnemo_core::SortOrder::Asc,
            10,
            0,
        )
        .unwrap();
    cells[0].event_id.clone()
}

/// Scenario 3: episode + 2 semantic + 3 facts → 6 vector and 6 inverted
/// records.
#[tokio::test]
async fn fanout_counts_match_derived_records() {
    let harness = TestHarness::new();
    let parent = extract_rich_cell(&harness).await;

    let stats = harness.engine.stats().unwrap();
    assert_eq!(stats.vector_records, 6);
    assert_eq!(stats.keyword_records, 6);
    assert_eq!(stats.document_records, 6);

    // the cell carries its children
    let cell = harness.engine.store().get_memcell(&parent).unwrap().unwrap();
    assert_eq!(cell.semantic_memories.len(), 2);
    assert_eq!(cell.event_log.as_ref().unwrap().atomic_fact.len(), 3);
    assert!(cell.event_log.as_ref().unwrap().is_consistent());
}

/// P5: every derived record is addressable as `<parent>_<kind>_<k>` and
/// reports the parent id.
#[tokio::test]
async fn fanout_identity_is_structural() {
    let harness = TestHarness::new();
    let parent = extract_rich_cell(&harness).await;

    // retrieve everything for the group through the keyword index
    let response = harness
        .engine
        .retrieve(&RetrieveRequest {
            user_id: None,
            group_id: Some("G".to_string()),
            query: "alice espresso offsite venue invite".to_string(),
            retrieve_method: RetrieveMethod::Keyword,
            top_k: 20,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(response.total_count >= 1);
    let group_memories = response.memories[0].get("G").unwrap();
    for memory in group_memories {
        let (hit_parent, kind, ordinal) =
            parse_child_record_id(&memory.record_id).expect("structural child id");
        assert_eq!(hit_parent, parent);
        match kind {
            RecordKind::Episode => assert_eq!(ordinal, 0),
            RecordKind::SemanticMemory => assert!(ordinal < 2),
            RecordKind::EventLog => assert!(ordinal < 3),
        }
        assert_eq!(memory.memcell_event_id_list, vec![parent.clone()]);
    }
}

/// A cell without semantic memories fans out its episode and facts alone.
#[tokio::test]
async fn single_fact_log_fans_out_alone() {
    let harness = TestHarness::new();
    harness.oracle.set_eventlog(r#"{"atomic_fact": ["only fact"]}"#);
    harness
        .engine
        .memorize(message("G", "m1", "alice", 100, "hello"))
        .await
        .unwrap();
    harness.oracle.push_boundary(0, "episode");
    harness
        .engine
        .memorize(message("G", "m2", "alice", 9000, "next"))
        .await
        .unwrap();

    let stats = harness.engine.stats().unwrap();
    // episode + 1 event-log fact, no semantic memories
    assert_eq!(stats.vector_records, 2);
    assert_eq!(stats.keyword_records, 2);
}
