//! Authoritative task table, FIFO queue, and admission control.
//!
//! One mutex guards the whole table; every operation under it is O(1)-ish
//! and never touches the filesystem. Operations that make files obsolete
//! (evictions, cancellations) hand the paths back to the caller, which
//! deletes them after the lock is released.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{PoolStatus, ResultDescriptor, Task, TaskFailure, TaskSnapshot, TaskState};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },
}

/// Why a submission was not admitted.
#[derive(Debug)]
pub enum AdmitError {
    /// The id belongs to a task that is still queued or processing.
    Conflict,
    /// Admitting one more task would exceed capacity.
    PoolFull(PoolStatus),
}

/// Artifacts freed by an eviction or cancellation; the caller deletes them
/// outside the registry lock.
#[derive(Debug, Default)]
pub struct Evicted {
    pub bundle_path: Option<PathBuf>,
    pub result_path: Option<PathBuf>,
}

/// Outcome of a cancellation request from the HTTP surface.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The task was still queued and is now terminally cancelled.
    Cancelled(Evicted),
    /// The task is processing; the worker and driver have been signalled and
    /// will finish the cancellation cooperatively.
    Signalled,
    /// The task was already terminal; nothing to do.
    AlreadyTerminal,
}

/// Everything the worker needs to run one claimed task.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: String,
    pub model: String,
    pub bundle_path: PathBuf,
    pub bundle_key: String,
    pub cancel: CancellationToken,
}

struct Inner {
    tasks: HashMap<String, Task>,
    /// Ids in admission order; entries whose task left `Queued` are skipped
    /// lazily at claim time.
    queue: VecDeque<String>,
}

/// Mutex-guarded task table plus the worker wakeup.
pub struct TaskRegistry {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                queue: VecDeque::new(),
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Admit a new submission.
    ///
    /// An existing terminal task with the same id is evicted first (its
    /// artifact paths are returned for deletion); an existing non-terminal
    /// one is a conflict. Capacity counts the admitted-but-not-terminal set,
    /// including the synthetic increment for the task being admitted.
    pub fn admit(
        &self,
        id: String,
        model: String,
        bundle_path: PathBuf,
        bundle_key: String,
    ) -> Result<Option<Evicted>, AdmitError> {
        let evicted;
        {
            let mut inner = self.inner.lock().expect("registry lock poisoned");

            let existing_is_terminal = match inner.tasks.get(&id) {
                Some(existing) => {
                    if !existing.state.is_terminal() {
                        return Err(AdmitError::Conflict);
                    }
                    true
                }
                None => false,
            };

            // Capacity before eviction: a rejected resubmission must leave
            // the previous terminal record and its artifacts untouched.
            let pool = pool_view_locked(&inner, self.capacity);
            if pool.current_size + 1 > self.capacity {
                return Err(AdmitError::PoolFull(pool));
            }

            evicted = if existing_is_terminal {
                debug!(task_id = %id, "replacing terminal task on resubmission");
                inner.tasks.remove(&id).map(take_artifacts)
            } else {
                None
            };

            let task = Task::new(id.clone(), model, bundle_path, bundle_key, Utc::now());
            inner.tasks.insert(id.clone(), task);
            inner.queue.push_back(id.clone());
        }

        info!(task_id = %id, "task admitted");
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Pop the oldest still-queued task and mark it processing. Returns
    /// `None` when no queued task remains.
    pub fn claim_next(&self) -> Option<ClaimedTask> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        while let Some(id) = inner.queue.pop_front() {
            let Some(task) = inner.tasks.get_mut(&id) else {
                continue; // evicted while queued
            };
            if task.state != TaskState::Queued {
                continue; // cancelled while queued
            }
            task.state = TaskState::Processing;
            task.started_at = Some(Utc::now());
            return Some(ClaimedTask {
                id: task.id.clone(),
                model: task.model.clone(),
                bundle_path: task.bundle_path.clone().unwrap_or_default(),
                bundle_key: task.bundle_key.clone(),
                cancel: task.cancel.clone(),
            });
        }
        None
    }

    /// Suspend until [`Self::admit`] signals new work. A notification that
    /// raced ahead of the wait is not lost.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub fn complete(&self, id: &str, result: ResultDescriptor) -> Result<(), RegistryError> {
        self.terminate(id, TaskState::Completed, Some(result), None)
    }

    pub fn fail(&self, id: &str, failure: TaskFailure) -> Result<(), RegistryError> {
        self.terminate(id, TaskState::Failed, None, Some(failure))
    }

    /// Terminal transition used by the worker when a claimed task observes
    /// its cancellation signal (before spawn or mid-run).
    pub fn finish_cancelled(&self, id: &str) -> Result<(), RegistryError> {
        self.terminate(id, TaskState::Cancelled, None, None)
    }

    fn terminate(
        &self,
        id: &str,
        to: TaskState,
        result: Option<ResultDescriptor>,
        failure: Option<TaskFailure>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;

        if task.state == to {
            return Ok(()); // idempotent repeat of the same terminal outcome
        }
        if task.state.is_terminal() {
            return Err(RegistryError::InvalidTransition {
                id: id.to_owned(),
                from: task.state,
                to,
            });
        }

        task.state = to;
        task.finished_at = Some(Utc::now());
        task.bundle_path = None;
        task.result = result;
        task.error = failure;
        Ok(())
    }

    /// Cancellation entry point for the HTTP surface.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;

        match task.state {
            TaskState::Queued => {
                task.state = TaskState::Cancelled;
                task.finished_at = Some(Utc::now());
                task.cancel.cancel();
                let evicted = Evicted {
                    bundle_path: task.bundle_path.take(),
                    result_path: None,
                };
                info!(task_id = %id, "queued task cancelled");
                Ok(CancelOutcome::Cancelled(evicted))
            }
            TaskState::Processing => {
                task.cancel.cancel();
                info!(task_id = %id, "processing task signalled for cancellation");
                Ok(CancelOutcome::Signalled)
            }
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    /// Remove a terminal task record entirely, returning its artifacts.
    /// Returns `None` for unknown ids and for non-terminal tasks.
    pub fn evict(&self, id: &str) -> Option<Evicted> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let is_terminal = inner
            .tasks
            .get(id)
            .is_some_and(|task| task.state.is_terminal());
        if !is_terminal {
            return None;
        }
        inner.tasks.remove(id).map(take_artifacts)
    }

    /// Drop the result descriptor (and report its path) without touching the
    /// rest of the record. Idempotent.
    pub fn delete_result(&self, id: &str) -> Option<PathBuf> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .tasks
            .get_mut(id)
            .and_then(|task| task.result.take())
            .map(|descriptor| descriptor.path)
    }

    /// Remove terminal records whose retention has run out. Completed tasks
    /// expire with their descriptor; failed/cancelled ones `retention` after
    /// they finished.
    pub fn evict_expired(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Vec<(String, Evicted)> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let expired: Vec<String> = inner
            .tasks
            .values()
            .filter(|task| match (&task.state, &task.result) {
                (state, _) if !state.is_terminal() => false,
                (_, Some(result)) => now >= result.expires_at,
                (_, None) => task
                    .finished_at
                    .map(|finished| now - finished >= retention)
                    .unwrap_or(false),
            })
            .map(|task| task.id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                inner.tasks.remove(&id).map(|task| {
                    warn!(task_id = %id, "evicting expired task record");
                    (id, take_artifacts(task))
                })
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<TaskSnapshot> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.tasks.get(id).map(Task::snapshot)
    }

    pub fn result(&self, id: &str) -> Option<ResultDescriptor> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.tasks.get(id).and_then(|task| task.result.clone())
    }

    pub fn pool_view(&self) -> PoolStatus {
        let inner = self.inner.lock().expect("registry lock poisoned");
        pool_view_locked(&inner, self.capacity)
    }

    /// Snapshots of every known task, newest submission first.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut snapshots: Vec<TaskSnapshot> = inner.tasks.values().map(Task::snapshot).collect();
        snapshots.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        snapshots
    }

    /// Completed results, newest first.
    pub fn list_results(&self) -> Vec<(String, ResultDescriptor)> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut results: Vec<(String, ResultDescriptor)> = inner
            .tasks
            .values()
            .filter_map(|task| task.result.clone().map(|r| (task.id.clone(), r)))
            .collect();
        results.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        results
    }

    /// Per-state task counts for the stats endpoint.
    pub fn counts(&self) -> HashMap<TaskState, usize> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut counts = HashMap::new();
        for task in inner.tasks.values() {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        counts
    }
}

fn pool_view_locked(inner: &Inner, capacity: usize) -> PoolStatus {
    let mut queued = 0usize;
    let mut processing = 0usize;
    for task in inner.tasks.values() {
        match task.state {
            TaskState::Queued => queued += 1,
            TaskState::Processing => processing += 1,
            _ => {}
        }
    }
    let current_size = queued + processing;
    PoolStatus {
        is_full: current_size >= capacity,
        current_size,
        max_size: capacity,
        processing_count: processing,
    }
}

fn take_artifacts(task: Task) -> Evicted {
    Evicted {
        bundle_path: task.bundle_path,
        result_path: task.result.map(|r| r.path),
    }
}
