//! Conversation-meta endpoints
//!
//! CRUD over per-group configuration records, keyed by `group_id`. A record
//! without a `group_id` is the default config; GET falls back to it when a
//! specific group has no record of its own.

use axum::body::Bytes;
use axum::extract::{OriginalUri, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use mnemo_core::{ConversationMeta, MetaPatch, Scene};

use super::envelope::{ok, ApiError};
use super::params::{get_str, merge_params};
use crate::state::AppState;

// ============================================================================
// GET /api/v1/memories/conversation-meta
// ============================================================================

/// Get conversation metadata with default-config fallback
pub async fn get_conversation_meta(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let params = merge_params(query, &body);
    let group_id = get_str(&params, "group_id");

    info!("Received conversation-meta get request: group_id={group_id:?}");

    let (meta, is_default) = state
        .engine
        .conversation_meta(group_id.as_deref())
        .map_err(|e| ApiError::from_engine(&path, e))?;

    let message = if is_default && group_id.is_some() {
        "Using default config"
    } else {
        "Conversation metadata retrieved successfully"
    };

    let mut result = serde_json::to_value(&meta)
        .map_err(|e| ApiError::system(&path, e.to_string()))?;
    if let Value::Object(object) = &mut result {
        object.insert("is_default".to_string(), Value::Bool(is_default));
    }
    Ok(ok(message, result))
}

// ============================================================================
// POST /api/v1/memories/conversation-meta
// ============================================================================

/// Full-record create/replace request
#[derive(Debug, Deserialize)]
pub struct MetaCreateRequest {
    /// Target group; omitted saves the default config
    #[serde(default)]
    pub group_id: Option<String>,
    /// Scene name, validated against the closed set
    pub scene: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Scene description
    #[serde(default)]
    pub scene_desc: Option<String>,
    /// Per-user details
    #[serde(default)]
    pub user_details: BTreeMap<String, Value>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Default timezone
    #[serde(default)]
    pub default_timezone: Option<String>,
    /// Record format version
    #[serde(default)]
    pub version: Option<String>,
}

/// Save conversation metadata (full upsert)
pub async fn save_conversation_meta(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let request: MetaCreateRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid(&path, e.to_string()))?;

    let Some(scene) = Scene::parse_name(&request.scene) else {
        return Err(ApiError::validation(
            &path,
            format!(
                "Field 'scene': invalid scene value: {}, allowed values: ['group_chat', 'assistant']",
                request.scene
            ),
        ));
    };

    info!("Received conversation-meta save request: group_id={:?}", request.group_id);

    let meta = ConversationMeta {
        group_id: request.group_id,
        scene,
        name: request.name,
        description: request.description,
        scene_desc: request.scene_desc,
        user_details: request.user_details,
        tags: request.tags,
        default_timezone: request.default_timezone,
        version: request.version.unwrap_or_else(|| "1.0".to_string()),
        created_at: None,
        updated_at: None,
    };

    let saved = state
        .engine
        .save_conversation_meta(meta)
        .map_err(|e| ApiError::from_engine(&path, e))?;
    Ok(ok("Conversation metadata saved successfully", saved))
}

// ============================================================================
// PATCH /api/v1/memories/conversation-meta
// ============================================================================

/// Partial-update request; core fields are not patchable
#[derive(Debug, Deserialize)]
pub struct MetaPatchRequest {
    /// Target group; omitted patches the default config
    #[serde(default)]
    pub group_id: Option<String>,
    /// Patchable fields
    #[serde(flatten)]
    pub patch: MetaPatch,
}

/// Partially update conversation metadata
pub async fn patch_conversation_meta(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let request: MetaPatchRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid(&path, e.to_string()))?;

    info!(
        "Received conversation-meta partial update request: group_id={:?}",
        request.group_id
    );

    let (meta, updated_fields) = state
        .engine
        .patch_conversation_meta(request.group_id.as_deref(), &request.patch)
        .map_err(|e| ApiError::from_engine(&path, e))?;

    if updated_fields.is_empty() {
        return Ok(ok(
            "No fields need updating",
            json!({"group_id": meta.group_id, "updated_fields": []}),
        ));
    }

    Ok(ok(
        format!(
            "Conversation metadata updated successfully, updated {} fields",
            updated_fields.len()
        ),
        json!({
            "group_id": meta.group_id,
            "scene": meta.scene,
            "name": meta.name,
            "updated_fields": updated_fields,
            "updated_at": meta.updated_at,
        }),
    ))
}
