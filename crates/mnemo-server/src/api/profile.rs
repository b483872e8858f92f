//! Global user-profile endpoints
//!
//! `POST /api/v1/global-user-profile/custom` merges caller-supplied seed
//! data into a user's profile record (top-level field overwrite).

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::envelope::{ok, ApiError};
use crate::state::AppState;

/// Seed data accepted by the custom-profile endpoint
#[derive(Debug, Default, Deserialize)]
pub struct CustomProfileData {
    /// Seed lines shown to the profile extractor
    #[serde(default)]
    pub initial_profile: Vec<String>,
}

/// Request body
#[derive(Debug, Deserialize)]
pub struct CustomProfileRequest {
    /// Target user
    pub user_id: String,
    /// Seed payload
    #[serde(default)]
    pub custom_profile_data: CustomProfileData,
}

/// Merge custom profile data into the user's record
pub async fn set_custom_profile(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = uri.path().to_string();
    let request: CustomProfileRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid(&path, e.to_string()))?;

    info!("Received custom-profile request: user_id={}", request.user_id);

    let profile = state
        .engine
        .merge_custom_profile(&request.user_id, request.custom_profile_data.initial_profile)
        .map_err(|e| ApiError::from_engine(&path, e))?;

    Ok(ok("Custom profile data saved successfully", profile))
}
