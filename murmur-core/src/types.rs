//! Core task model shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a task.
///
/// Allowed transitions: `Queued → Processing → {Completed | Failed}`.
/// `Cancelled` is reached from `Queued`, or from `Processing` through the
/// worker's cooperative-cancel path. Terminal states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure recorded on a task.
///
/// `code` is one of the short dotted identifiers (`bundle.auth`,
/// `transcriber.exit`, ...); `message` is the human-readable detail.
/// Clients never see more than this, in particular no raw subprocess
/// stderr beyond the tail the driver captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Where a completed subtitle artifact lives and how long it stays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDescriptor {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Derived view of the admitted-but-not-terminal task set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub is_full: bool,
    pub current_size: usize,
    pub max_size: usize,
    pub processing_count: usize,
}

/// Authoritative record held by the registry for one task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub model: String,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TaskFailure>,
    /// Inbound bundle on disk; cleared when the task reaches a terminal state.
    pub bundle_path: Option<PathBuf>,
    /// Archive password supplied at submission, used by the worker to unpack.
    pub bundle_key: String,
    pub result: Option<ResultDescriptor>,
    /// Cooperative cancellation signal observed by the worker and the driver.
    pub cancel: CancellationToken,
}

impl Task {
    pub fn new(
        id: String,
        model: String,
        bundle_path: PathBuf,
        bundle_key: String,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            model,
            state: TaskState::Queued,
            submitted_at,
            started_at: None,
            finished_at: None,
            error: None,
            bundle_path: Some(bundle_path),
            bundle_key,
            result: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            state: self.state,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of a task returned to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TaskFailure>,
}
