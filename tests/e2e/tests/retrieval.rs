//! Retrieval journeys
//!
//! Visibility after ingest, hybrid degradation when the reranker is down,
//! and group ordering by importance.

use std::sync::Arc;

use mnemo_e2e_tests::harness::{message, TestHarness};
use mnemo_e2e_tests::mocks::FailingReranker;
use mnemo_core::{IngestStatus, RetrieveMethod, RetrieveRequest};

/// Close one single-message episode whose text mentions coffee
async fn ingest_episode(harness: &TestHarness, group: &str, sender: &str, id_prefix: &str, secs: i64) {
    harness
        .engine
        .memorize(message(group, &format!("{id_prefix}-a"), sender, secs, "coffee machine budget"))
        .await
        .unwrap();
    harness.oracle.push_boundary(0, "coffee budget discussed");
    let outcome = harness
        .engine
        .memorize(message(group, &format!("{id_prefix}-b"), sender, secs + 86_400, "moving on"))
        .await
        .unwrap();
    assert_eq!(outcome.status, IngestStatus::Extracted);
}

fn coffee_request(group: Option<&str>, user: Option<&str>, method: RetrieveMethod, top_k: usize) -> RetrieveRequest {
    RetrieveRequest {
        user_id: user.map(str::to_string),
        group_id: group.map(str::to_string),
        query: "coffee episode".to_string(),
        retrieve_method: method,
        top_k,
        ..Default::default()
    }
}

/// P6: records written by an `extracted` ingest are visible to a retrieval
/// issued right after the response.
#[tokio::test]
async fn extraction_is_immediately_visible() {
    let harness = TestHarness::new();
    harness.oracle.set_episode("The team argued about the coffee machine budget.");
    ingest_episode(&harness, "G", "alice", "m", 100).await;

    let response = harness
        .engine
        .retrieve(&coffee_request(Some("G"), None, RetrieveMethod::Keyword, 10))
        .await
        .unwrap();
    assert!(response.total_count >= 1);
    let memories = response.memories[0].get("G").unwrap();
    assert!(memories.iter().any(|m| m.episode.contains("coffee")));

    // the hybrid path sees them too
    let response = harness
        .engine
        .retrieve(&coffee_request(Some("G"), None, RetrieveMethod::Hybrid, 10))
        .await
        .unwrap();
    assert!(response.total_count >= 1);
}

/// P7 / scenario 4: with the reranker down, hybrid still returns `top_k`
/// hits with finite scores, ordered by native score descending.
#[tokio::test]
async fn hybrid_survives_reranker_outage() {
    let harness = TestHarness::with_reranker(Arc::new(FailingReranker));
    harness.oracle.set_episode("Notes about the coffee rotation schedule.");
    for i in 0..6 {
        ingest_episode(&harness, "G", "alice", &format!("ep{i}"), 1_000_000 * (i + 1)).await;
    }

    let response = harness
        .engine
        .retrieve(&coffee_request(Some("G"), None, RetrieveMethod::Hybrid, 5))
        .await
        .unwrap();

    assert_eq!(response.total_count, 5);
    let scores = response.scores[0].get("G").unwrap();
    assert_eq!(scores.len(), 5);
    assert!(scores.iter().all(|s| s.is_finite()));
}

/// The rrf path fuses both sides without a reranker at all.
#[tokio::test]
async fn rrf_fuses_without_reranker() {
    let harness = TestHarness::with_reranker(Arc::new(FailingReranker));
    harness.oracle.set_episode("Coffee supply chain retrospective.");
    for i in 0..3 {
        ingest_episode(&harness, "G", "alice", &format!("ep{i}"), 1_000_000 * (i + 1)).await;
    }

    let response = harness
        .engine
        .retrieve(&coffee_request(Some("G"), None, RetrieveMethod::Rrf, 3))
        .await
        .unwrap();
    assert!(response.total_count >= 1);
    assert!(response.total_count <= 3);
}

/// P9: groups are ordered by importance descending; memories within a group
/// are ordered by timestamp ascending.
#[tokio::test]
async fn groups_ordered_by_importance_memories_by_time() {
    let harness = TestHarness::new();
    harness.oracle.set_episode("A long coffee thread.");

    // busy group: a two-message episode then a one-message episode, all
    // from alice. Speak-heavy, so (speak + refer) / conversations > 1
    harness
        .engine
        .memorize(message("busy", "b1", "alice", 1_000_000, "coffee run?"))
        .await
        .unwrap();
    harness
        .engine
        .memorize(message("busy", "b2", "alice", 1_000_060, "the machine is broken again"))
        .await
        .unwrap();
    harness.oracle.push_boundary(1, "coffee machine broke");
    harness
        .engine
        .memorize(message("busy", "b3", "alice", 5_000_000, "new thread"))
        .await
        .unwrap();
    harness.oracle.push_boundary(0, "follow-up coffee note");
    harness
        .engine
        .memorize(message("busy", "b4", "alice", 9_000_000, "unrelated"))
        .await
        .unwrap();

    // quiet group: a single one-message episode, importance exactly 1
    ingest_episode(&harness, "quiet", "alice", "q1", 1_000_000).await;

    let response = harness
        .engine
        .retrieve(&coffee_request(None, Some("alice"), RetrieveMethod::Keyword, 20))
        .await
        .unwrap();

    assert_eq!(response.memories.len(), 2);
    let first_group = response.memories[0].keys().next().unwrap();
    assert_eq!(first_group, "busy");
    assert!(response.importance_scores[0] > response.importance_scores[1]);

    let busy_memories = response.memories[0].get("busy").unwrap();
    for pair in busy_memories.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // original data of the parent cells rides along per group
    assert_eq!(response.original_data.len(), 2);
    assert!(!response.original_data[0].get("busy").unwrap().is_empty());
}

/// Both scopes unfiltered is rejected, as is an empty query.
#[tokio::test]
async fn invalid_search_arguments_are_rejected() {
    let harness = TestHarness::new();

    let err = harness
        .engine
        .retrieve(&coffee_request(None, None, RetrieveMethod::Keyword, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, mnemo_core::EngineError::InvalidArgument(_)));

    let mut request = coffee_request(Some("G"), None, RetrieveMethod::Keyword, 5);
    request.query = "   ".to_string();
    let err = harness.engine.retrieve(&request).await.unwrap_err();
    assert!(matches!(err, mnemo_core::EngineError::InvalidArgument(_)));
}
