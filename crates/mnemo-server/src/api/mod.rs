//! HTTP surface
//!
//! Route table of the memory service. All endpoints live under `/api/v1`;
//! see the handler modules for the individual contracts.

mod envelope;
pub mod memories;
pub mod meta;
pub mod params;
pub mod profile;

pub use envelope::ApiError;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the service router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/memories", post(memories::memorize_message))
        .route("/api/v1/memories", get(memories::fetch_memories))
        .route("/api/v1/memories", delete(memories::delete_memories))
        .route("/api/v1/memories/search", get(memories::search_memories))
        .route(
            "/api/v1/memories/conversation-meta",
            get(meta::get_conversation_meta)
                .post(meta::save_conversation_meta)
                .patch(meta::patch_conversation_meta),
        )
        .route(
            "/api/v1/global-user-profile/custom",
            post(profile::set_custom_profile),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
