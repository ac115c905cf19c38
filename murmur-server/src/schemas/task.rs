//! Wire shapes for the task endpoints.

use murmur_core::{PoolStatus, ResultDescriptor, TaskFailure, TaskSnapshot};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct SubmitResponse {
    pub task_id: String,
    pub accepted_at: String,
}

#[derive(Serialize, ToSchema)]
pub struct TaskErrorBody {
    pub code: String,
    pub message: String,
}

impl From<TaskFailure> for TaskErrorBody {
    fn from(f: TaskFailure) -> Self {
        Self {
            code: f.code,
            message: f.message,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub state: String,
    pub submitted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorBody>,
}

impl From<TaskSnapshot> for TaskStatusResponse {
    fn from(s: TaskSnapshot) -> Self {
        Self {
            task_id: s.task_id,
            state: s.state.as_str().to_owned(),
            submitted_at: s.submitted_at.to_rfc3339(),
            started_at: s.started_at.map(|t| t.to_rfc3339()),
            finished_at: s.finished_at.map(|t| t.to_rfc3339()),
            error: s.error.map(Into::into),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ResultResponse {
    pub task_id: String,
    pub srt_size: u64,
    pub created_at: String,
    pub expires_at: String,
}

impl ResultResponse {
    pub fn new(task_id: String, descriptor: &ResultDescriptor) -> Self {
        Self {
            task_id,
            srt_size: descriptor.size_bytes,
            created_at: descriptor.created_at.to_rfc3339(),
            expires_at: descriptor.expires_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PoolStatusResponse {
    pub is_full: bool,
    pub current_size: usize,
    pub max_size: usize,
    pub processing_count: usize,
}

impl From<PoolStatus> for PoolStatusResponse {
    fn from(p: PoolStatus) -> Self {
        Self {
            is_full: p.is_full,
            current_size: p.current_size,
            max_size: p.max_size,
            processing_count: p.processing_count,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use murmur_core::TaskState;

    #[test]
    fn status_response_omits_absent_fields() {
        let snapshot = TaskSnapshot {
            task_id: "t".into(),
            state: TaskState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        let body = serde_json::to_value(TaskStatusResponse::from(snapshot)).unwrap();
        assert_eq!(body["state"], "queued");
        assert!(body.get("started_at").is_none());
        assert!(body.get("error").is_none());
    }
}
