//! Task lifecycle endpoints: submit, status, result, download, cancel.

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use murmur_core::registry::{AdmitError, CancelOutcome, Evicted};
use murmur_core::{store, RegistryError, TaskState};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::task::{ResultResponse, SubmitResponse, TaskStatusResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        submit_task,
        get_task_status,
        get_task_result,
        download_task_result,
        delete_task_result,
        delete_task,
        list_tasks
    ),
    components(schemas(SubmitResponse, TaskStatusResponse, ResultResponse))
)]
pub struct TasksApi;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/submit", post(submit_task))
        .route("/tasks/{id}/status", get(get_task_status))
        .route(
            "/tasks/{id}/result",
            get(get_task_result).delete(delete_task_result),
        )
        .route("/tasks/{id}/result/download", get(download_task_result))
        .route("/tasks/{id}", delete(delete_task))
}

/// Accepted multipart field names for the bundle payload.
const BUNDLE_FIELDS: [&str; 2] = ["task_file", "audio_file"];

/// Task ids are any printable ASCII up to 128 bytes. They never reach the
/// filesystem or HTTP headers verbatim: the store derives safe on-disk names
/// and the download handler escapes the `Content-Disposition` value.
fn validate_task_id(id: &str) -> Result<(), ServerError> {
    if id.is_empty() || id.len() > 128 {
        return Err(ServerError::BadRequest(
            "task_id must be 1..=128 characters".into(),
        ));
    }
    if !id.chars().all(|c| matches!(c, ' '..='~')) {
        return Err(ServerError::BadRequest(
            "task_id must be printable ASCII".into(),
        ));
    }
    Ok(())
}

/// Submit an encrypted task bundle (`POST /tasks/submit`).
///
/// multipart/form-data fields: `task_id` (required), `model` (optional,
/// allow-listed), `password` (required, the bundle key), and the bundle
/// itself under `task_file` (alias `audio_file`).
#[utoipa::path(
    post,
    path = "/tasks/submit",
    tag = "tasks",
    responses(
        (status = 202, description = "Task admitted", body = SubmitResponse),
        (status = 400, description = "Malformed submission"),
        (status = 409, description = "Duplicate non-terminal task id"),
        (status = 429, description = "Pool is full"),
    )
)]
pub async fn submit_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ServerError> {
    let max_bytes = state.config.max_upload_bytes();

    let mut task_id: Option<String> = None;
    let mut model: Option<String> = None;
    let mut password: Option<String> = None;
    let mut bundle: Option<Vec<u8>> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("cannot read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or("").to_owned();
        match name.as_str() {
            "task_id" => task_id = Some(read_text_field(field, "task_id").await?),
            "model" => model = Some(read_text_field(field, "model").await?),
            "password" => password = Some(read_text_field(field, "password").await?),
            _ if BUNDLE_FIELDS.contains(&name.as_str()) => {
                let mut buf: Vec<u8> = Vec::new();
                while let Some(chunk) = field.chunk().await.map_err(|e| {
                    ServerError::BadRequest(format!("cannot read bundle payload: {e}"))
                })? {
                    if buf.len() + chunk.len() > max_bytes {
                        return Err(ServerError::BadRequest(format!(
                            "bundle exceeds maximum size of {} MiB",
                            state.config.max_upload_mb
                        )));
                    }
                    buf.extend_from_slice(&chunk);
                }
                bundle = Some(buf);
            }
            other => {
                return Err(ServerError::BadRequest(format!(
                    "unknown multipart field: {other}"
                )));
            }
        }
    }

    let task_id = task_id.ok_or_else(|| ServerError::BadRequest("task_id field missing".into()))?;
    validate_task_id(&task_id)?;
    let password =
        password.ok_or_else(|| ServerError::BadRequest("password field missing".into()))?;
    if password.is_empty() {
        return Err(ServerError::BadRequest("password must not be empty".into()));
    }
    let model = model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.default_model.clone());
    if !state.config.model_allowed(&model) {
        return Err(ServerError::BadRequest(format!("unknown model: {model}")));
    }
    let bundle = bundle
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ServerError::BadRequest("task_file field missing or empty".into()))?;

    // Cheap pre-check so a full pool rejects before any disk write. The
    // authoritative check happens inside admit().
    let pool = state.registry.pool_view();
    if pool.is_full {
        return Err(ServerError::PoolFull(pool));
    }

    let bundle_path = state.store.put_bundle(&task_id, &bundle).await?;

    match state
        .registry
        .admit(task_id.clone(), model, bundle_path.clone(), password)
    {
        Ok(evicted) => {
            if let Some(evicted) = evicted {
                remove_evicted(evicted).await;
            }
            let accepted_at = Utc::now();
            info!(task_id = %task_id, "task submitted");
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    task_id,
                    accepted_at: accepted_at.to_rfc3339(),
                }),
            ))
        }
        Err(AdmitError::Conflict) => {
            store::remove_file(&bundle_path).await;
            Err(ServerError::Conflict(format!(
                "task {task_id} is already queued or processing"
            )))
        }
        Err(AdmitError::PoolFull(pool)) => {
            store::remove_file(&bundle_path).await;
            Err(ServerError::PoolFull(pool))
        }
    }
}

async fn read_text_field(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, ServerError> {
    field
        .text()
        .await
        .map_err(|e| ServerError::BadRequest(format!("cannot read field {name}: {e}")))
}

async fn remove_evicted(evicted: Evicted) {
    if let Some(path) = evicted.bundle_path {
        store::remove_file(&path).await;
    }
    if let Some(path) = evicted.result_path {
        store::remove_file(&path).await;
    }
}

/// Task state and timestamps (`GET /tasks/{id}/status`).
#[utoipa::path(
    get,
    path = "/tasks/{id}/status",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task snapshot", body = TaskStatusResponse),
        (status = 404, description = "Unknown task"),
    )
)]
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let snapshot = state
        .registry
        .status(&id)
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    Ok(Json(snapshot.into()))
}

/// Result descriptor for a completed task (`GET /tasks/{id}/result`).
#[utoipa::path(
    get,
    path = "/tasks/{id}/result",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Result descriptor", body = ResultResponse),
        (status = 404, description = "Unknown task or expired result"),
        (status = 409, description = "Task is not completed"),
    )
)]
pub async fn get_task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResultResponse>, ServerError> {
    let descriptor = lookup_completed_result(&state, &id)?;
    Ok(Json(ResultResponse::new(id, &descriptor)))
}

/// Raw SRT download (`GET /tasks/{id}/result/download`).
#[utoipa::path(
    get,
    path = "/tasks/{id}/result/download",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "SRT payload"),
        (status = 404, description = "Unknown task or expired result"),
        (status = 409, description = "Task is not completed"),
    )
)]
pub async fn download_task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServerError> {
    let descriptor = lookup_completed_result(&state, &id)?;

    let file = tokio::fs::File::open(&descriptor.path).await.map_err(|e| {
        warn!(task_id = %id, path = %descriptor.path.display(), error = %e, "result file unreadable");
        ServerError::NotFound(format!("result for task {id} is no longer available"))
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-subrip")
        .header(header::CONTENT_DISPOSITION, content_disposition(&id))
        .header(header::CONTENT_LENGTH, descriptor.size_bytes)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ServerError::Internal(format!("cannot build download response: {e}")))
}

/// `attachment; filename="{task_id}.srt"` with the id escaped as an RFC 6266
/// quoted-string, since printable-ASCII ids may contain `"` or `\`.
fn content_disposition(task_id: &str) -> String {
    let mut escaped = String::with_capacity(task_id.len());
    for c in task_id.chars() {
        if matches!(c, '"' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("attachment; filename=\"{escaped}.srt\"")
}

fn lookup_completed_result(
    state: &AppState,
    id: &str,
) -> Result<murmur_core::ResultDescriptor, ServerError> {
    let snapshot = state
        .registry
        .status(id)
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;

    match snapshot.state {
        TaskState::Completed => state
            .registry
            .result(id)
            .ok_or_else(|| ServerError::NotFound(format!("result for task {id} was removed"))),
        state => Err(ServerError::InvalidState(format!(
            "task {id} is {state}; no result available"
        ))),
    }
}

/// Remove a result artifact and its descriptor (`DELETE /tasks/{id}/result`).
/// Idempotent: unknown ids and already-removed results are fine.
#[utoipa::path(
    delete,
    path = "/tasks/{id}/result",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses((status = 204, description = "Result removed (or never existed)"))
)]
pub async fn delete_task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    if let Some(path) = state.registry.delete_result(&id) {
        store::remove_file(&path).await;
        info!(task_id = %id, "result deleted");
    }
    StatusCode::NO_CONTENT
}

/// Cancel a non-terminal task, or evict a terminal one entirely
/// (`DELETE /tasks/{id}`). Idempotent.
#[utoipa::path(
    delete,
    path = "/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses((status = 204, description = "Task cancelled or evicted"))
)]
pub async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    match state.registry.cancel(&id) {
        Err(RegistryError::NotFound(_)) => {}
        Err(e) => warn!(task_id = %id, error = %e, "cancel failed"),
        Ok(CancelOutcome::Cancelled(evicted)) => {
            remove_evicted(evicted).await;
            info!(task_id = %id, "queued task cancelled");
        }
        Ok(CancelOutcome::Signalled) => {
            info!(task_id = %id, "running task signalled for cancellation");
        }
        Ok(CancelOutcome::AlreadyTerminal) => {
            if let Some(evicted) = state.registry.evict(&id) {
                remove_evicted(evicted).await;
                info!(task_id = %id, "terminal task evicted");
            }
        }
    }
    StatusCode::NO_CONTENT
}

/// All known tasks plus completed-result summaries (`GET /tasks`).
#[utoipa::path(
    get,
    path = "/tasks",
    tag = "tasks",
    responses((status = 200, description = "Task and result listings", body = Value))
)]
pub async fn list_tasks(State(state): State<AppState>) -> Json<Value> {
    let tasks: Vec<TaskStatusResponse> = state
        .registry
        .list()
        .into_iter()
        .map(Into::into)
        .collect();
    let results: Vec<ResultResponse> = state
        .registry
        .list_results()
        .into_iter()
        .map(|(id, descriptor)| ResultResponse::new(id, &descriptor))
        .collect();
    Json(serde_json::json!({ "tasks": tasks, "results": results }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn task_id_accepts_any_printable_ascii() {
        for id in [
            "T1",
            "abc-def_123",
            "a.b.c",
            "task 1",
            "id#7",
            "job:42",
            "a/b",
            "quo\"ted",
            &"x".repeat(128),
        ] {
            assert!(validate_task_id(id).is_ok(), "{id:?} should be accepted");
        }
    }

    #[test]
    fn task_id_rejects_empty_non_ascii_and_overlength() {
        for id in ["", "ü", "task\n1", "a\tb", "\u{7f}", &"x".repeat(129)] {
            assert!(validate_task_id(id).is_err(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn content_disposition_escapes_quotes_and_backslashes() {
        assert_eq!(
            content_disposition("plain"),
            "attachment; filename=\"plain.srt\""
        );
        assert_eq!(
            content_disposition("quo\"ted\\id"),
            "attachment; filename=\"quo\\\"ted\\\\id.srt\""
        );
    }
}
