//! Memory endpoints
//!
//! `POST /api/v1/memories` ingests one message.
//! `GET /api/v1/memories` fetches by scope and type.
//! `GET /api/v1/memories/search` serves relevance-ranked retrieval.
//! `DELETE /api/v1/memories` soft-deletes by combined filters.

use axum::body::Bytes;
use axum::extract::{OriginalUri, Query, State};
use axum::Json;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use mnemo_core::{
    IngestStatus, RawMessage, RetrieveMethod, RetrieveRequest, ScopeFilter, SortOrder,
};

use super::envelope::{ok, ApiError};
use super::params::{
    get_f32, get_str, get_str_list, get_usize, merge_params, parse_time_bound,
};
use crate::state::AppState;

/// Fetch limit cap on the HTTP surface (the adapters cap again at 500)
const FETCH_LIMIT_MAX: usize = 100;

// ============================================================================
// POST /api/v1/memories
// ============================================================================

/// Store one chat message; memories are extracted when a boundary triggers
pub async fn memorize_message(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid(&path, format!("Data format error: {e}")))?;
    let message: RawMessage = serde_json::from_value(payload.clone())
        .map_err(|e| ApiError::invalid(&path, format!("Data format error: {e}")))?;

    info!(
        "Received memorize request: group_id={:?}, message_id={}",
        message.group_id, message.message_id
    );

    // audit log first, then coordinate
    if let Err(e) = state
        .engine
        .log_request("memorize_single_message", "POST", &path, &message, &payload)
    {
        tracing::warn!("Request log write failed: {e}");
    }

    let outcome = state
        .engine
        .memorize(message)
        .await
        .map_err(|e| ApiError::from_engine(&path, e))?;

    let message_text = match outcome.status {
        IngestStatus::Extracted => format!("Extracted {} memories", outcome.count),
        IngestStatus::Accumulated => "Message queued, awaiting boundary detection".to_string(),
    };
    Ok(ok(
        message_text,
        json!({
            "saved_memories": [],
            "count": outcome.count,
            "status_info": outcome.status.as_str(),
        }),
    ))
}

// ============================================================================
// GET /api/v1/memories
// ============================================================================

/// Fetch memory records by type with scope and time filters
pub async fn fetch_memories(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let params = merge_params(query, &body);

    let user_id = ScopeFilter::normalize(get_str(&params, "user_id").as_deref());
    let group_id = ScopeFilter::normalize(get_str(&params, "group_id").as_deref());
    if user_id.is_none() && group_id.is_none() {
        return Err(ApiError::invalid(
            &path,
            "at least one of user_id and group_id must be a real value",
        ));
    }
    let memory_type =
        get_str(&params, "memory_type").unwrap_or_else(|| "episodic_memory".to_string());

    let limit = get_usize(&params, "limit").unwrap_or(20);
    if limit == 0 || limit > FETCH_LIMIT_MAX {
        return Err(ApiError::invalid(
            &path,
            format!("limit must be between 1 and {FETCH_LIMIT_MAX}"),
        ));
    }
    let offset = get_usize(&params, "offset").unwrap_or(0);
    let order = SortOrder::parse_name(&get_str(&params, "sort_order").unwrap_or_default());

    // profiles are keyed by user and carry no time range
    if memory_type == "profile" {
        let Some(user_id) = user_id else {
            return Err(ApiError::invalid(&path, "user_id is required for profile fetch"));
        };
        let profile = state
            .engine
            .get_profile(&user_id)
            .map_err(|e| ApiError::from_engine(&path, e))?;
        let memories: Vec<Value> = profile.into_iter().map(|p| json!(p)).collect();
        let total = memories.len();
        return Ok(ok(
            format!("Memory retrieval successful, retrieved {total} memories"),
            json!({
                "memories": memories,
                "total_count": total,
                "has_more": false,
                "metadata": {"source": "profile_store", "user_id": user_id, "memory_type": "fetch"},
            }),
        ));
    }

    let filter = ScopeFilter {
        user_id: user_id.clone(),
        group_id,
        start_ms: get_str(&params, "start_time").and_then(|s| parse_time_bound(&s, false)),
        end_ms: get_str(&params, "end_time").and_then(|s| parse_time_bound(&s, true)),
    };

    let (memories, total_count) = state
        .engine
        .fetch_memories(&filter, order, limit, offset)
        .map_err(|e| ApiError::from_engine(&path, e))?;
    let has_more = offset + memories.len() < total_count;

    Ok(ok(
        format!(
            "Memory retrieval successful, retrieved {} memories",
            memories.len()
        ),
        json!({
            "memories": memories,
            "total_count": total_count,
            "has_more": has_more,
            "metadata": {
                "source": "document_store",
                "user_id": user_id.unwrap_or_default(),
                "memory_type": memory_type,
            },
        }),
    ))
}

// ============================================================================
// GET /api/v1/memories/search
// ============================================================================

/// Search relevant memories (keyword / vector / hybrid / rrf / agentic)
pub async fn search_memories(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let params = merge_params(query, &body);

    let method_name = get_str(&params, "retrieve_method").unwrap_or_else(|| "keyword".to_string());
    let Some(retrieve_method) = RetrieveMethod::parse_name(&method_name) else {
        return Err(ApiError::invalid(
            &path,
            format!("unsupported retrieve_method: {method_name}"),
        ));
    };

    let request = RetrieveRequest {
        user_id: ScopeFilter::normalize(get_str(&params, "user_id").as_deref()),
        group_id: ScopeFilter::normalize(get_str(&params, "group_id").as_deref()),
        query: get_str(&params, "query").unwrap_or_default(),
        retrieve_method,
        top_k: get_usize(&params, "top_k").unwrap_or(10),
        memory_types: get_str_list(&params, "memory_types"),
        start_ms: get_str(&params, "start_time").and_then(|s| parse_time_bound(&s, false)),
        end_ms: get_str(&params, "end_time").and_then(|s| parse_time_bound(&s, true)),
        radius: get_f32(&params, "radius"),
    };

    let response = state
        .engine
        .retrieve(&request)
        .await
        .map_err(|e| ApiError::from_engine(&path, e))?;

    Ok(ok(
        format!(
            "Memory retrieval successful, retrieved {} memories",
            response.total_count
        ),
        response,
    ))
}

// ============================================================================
// DELETE /api/v1/memories
// ============================================================================

/// Soft-delete memories by combined filters (AND logic)
pub async fn delete_memories(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let params = merge_params(query, &body);

    let event_id = ScopeFilter::normalize(get_str(&params, "event_id").as_deref());
    let user_id = ScopeFilter::normalize(get_str(&params, "user_id").as_deref());
    let group_id = ScopeFilter::normalize(get_str(&params, "group_id").as_deref());

    info!(
        "Received delete request: event_id={event_id:?}, user_id={user_id:?}, group_id={group_id:?}"
    );

    let (filters, count) = state
        .engine
        .delete_memories(event_id.as_deref(), user_id.as_deref(), group_id.as_deref())
        .map_err(|e| ApiError::from_engine(&path, e))?;

    let noun = if count == 1 { "memory" } else { "memories" };
    Ok(ok(
        format!("Successfully deleted {count} {noun}"),
        json!({"filters": filters, "count": count}),
    ))
}
