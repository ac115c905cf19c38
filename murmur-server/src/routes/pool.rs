//! Pool visibility endpoints: admission state and aggregate statistics.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use murmur_core::TaskState;
use serde_json::{json, Value};
use utoipa::OpenApi;

use crate::schemas::task::PoolStatusResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(get_pool_status, get_stats),
    components(schemas(PoolStatusResponse))
)]
pub struct PoolApi;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pool/status", get(get_pool_status))
        .route("/stats", get(get_stats))
}

/// Current admission state. Clients poll this before submitting and back
/// off while `is_full` is set.
#[utoipa::path(
    get,
    path = "/pool/status",
    tag = "pool",
    responses(
        (status = 200, description = "Pool status", body = PoolStatusResponse)
    )
)]
pub async fn get_pool_status(State(state): State<AppState>) -> Json<PoolStatusResponse> {
    Json(state.registry.pool_view().into())
}

/// Aggregate statistics: pool view, per-state task counts, result count.
#[utoipa::path(
    get,
    path = "/stats",
    tag = "pool",
    responses(
        (status = 200, description = "Server statistics", body = Value)
    )
)]
pub async fn get_stats(State(state): State<AppState>) -> Json<Value> {
    let counts = state.registry.counts();
    let count_of = |s: TaskState| counts.get(&s).copied().unwrap_or(0);

    Json(json!({
        "pool": PoolStatusResponse::from(state.registry.pool_view()),
        "task_counts": {
            "queued": count_of(TaskState::Queued),
            "processing": count_of(TaskState::Processing),
            "completed": count_of(TaskState::Completed),
            "failed": count_of(TaskState::Failed),
            "cancelled": count_of(TaskState::Cancelled),
        },
        "result_count": state.registry.list_results().len(),
    }))
}
