//! On-disk artifact layout: inbound bundles, per-task scratch, results.
//!
//! Three disjoint roots are created at startup. Bundles and results are
//! published with write-to-temp + rename so a partially written file is never
//! observable under its final name.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::ResultDescriptor;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A working directory for this task already exists and was not dropped.
    #[error("working directory for task {0} is already in use")]
    WorkdirBusy(String),

    #[error("storage i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkdirBusy(_) => "storage.workdir",
            Self::Io { .. } => "storage.io",
        }
    }
}

/// Filesystem owner for everything the server persists.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    uploads: PathBuf,
    work: PathBuf,
    results: PathBuf,
}

/// On-disk name for a task id.
///
/// Task ids are arbitrary printable ASCII and may contain separators,
/// quotes, or `..`, so they never appear verbatim in a path. The name is a
/// sanitized prefix for readability plus a UUIDv5 digest of the raw id:
/// deterministic, bounded in length, and collision-free across distinct ids.
fn path_key(task_id: &str) -> String {
    let prefix: String = task_id
        .chars()
        .take(20)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, task_id.as_bytes()).simple();
    format!("{prefix}-{digest}")
}

impl ArtifactStore {
    /// Create the three roots (if absent) and return the store.
    pub async fn open(
        uploads: impl Into<PathBuf>,
        work: impl Into<PathBuf>,
        results: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            uploads: uploads.into(),
            work: work.into(),
            results: results.into(),
        };
        for root in [&store.uploads, &store.work, &store.results] {
            fs::create_dir_all(root)
                .await
                .map_err(StoreError::io(root.clone()))?;
        }
        Ok(store)
    }

    pub fn results_dir(&self) -> &Path {
        &self.results
    }

    fn result_path(&self, task_id: &str) -> PathBuf {
        self.results.join(format!("{}.srt", path_key(task_id)))
    }

    /// Persist an inbound bundle atomically under a per-submission unique
    /// name, so a resubmission never clobbers the bundle of a live task.
    pub async fn put_bundle(&self, task_id: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let key = path_key(task_id);
        let nonce = Uuid::new_v4().simple();
        let final_path = self.uploads.join(format!("{key}.{nonce}.bundle"));
        let tmp_path = self.uploads.join(format!(".{key}.{nonce}.tmp"));

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(StoreError::io(&tmp_path))?;
        file.write_all(bytes)
            .await
            .map_err(StoreError::io(&tmp_path))?;
        file.sync_all().await.map_err(StoreError::io(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(StoreError::io(&final_path))?;
        debug!(task_id, path = %final_path.display(), "bundle stored");
        Ok(final_path)
    }

    /// Claim an exclusive scratch directory for a task. Refuses an existing
    /// directory: it must be dropped before the id can be reused.
    pub async fn open_workdir(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.work.join(path_key(task_id));
        match fs::try_exists(&dir).await {
            Ok(true) => return Err(StoreError::WorkdirBusy(task_id.to_owned())),
            Ok(false) => {}
            Err(e) => return Err(StoreError::io(&dir)(e)),
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(StoreError::io(&dir))?;
        Ok(dir)
    }

    /// Recursively delete a task's scratch directory. Idempotent.
    pub async fn drop_workdir(&self, task_id: &str) {
        let dir = self.work.join(path_key(task_id));
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(task_id, "workdir dropped"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(task_id, error = %e, "failed to drop workdir"),
        }
    }

    /// Move a finished SRT into the results root under its stable task-keyed
    /// name and stamp the retention window. The final rename is what makes
    /// the artifact visible, so readers never observe a partial file.
    pub async fn publish_result(
        &self,
        task_id: &str,
        srt_path: &Path,
        retention: Duration,
    ) -> Result<ResultDescriptor, StoreError> {
        let final_path = self.result_path(task_id);
        let tmp_path = self.results.join(format!(".{}.srt.tmp", path_key(task_id)));

        // Copy + rename instead of a direct rename: the work root may live on
        // a different filesystem than the results root.
        fs::copy(srt_path, &tmp_path)
            .await
            .map_err(StoreError::io(&tmp_path))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(StoreError::io(&final_path))?;

        let size_bytes = fs::metadata(&final_path)
            .await
            .map_err(StoreError::io(&final_path))?
            .len();
        let created_at = Utc::now();
        Ok(ResultDescriptor {
            path: final_path,
            size_bytes,
            created_at,
            expires_at: created_at + retention,
        })
    }

    /// Remove a published result file. Idempotent.
    pub async fn delete_result(&self, task_id: &str) {
        remove_file(&self.result_path(task_id)).await;
    }

    /// Remove result files whose retention has passed judging by their
    /// modification time. This is the orphan backstop for files whose task
    /// record vanished across a restart; live records are evicted through
    /// the registry. Logs and keeps going on every per-file error.
    pub async fn sweep(&self, now: DateTime<Utc>, retention: Duration) {
        let mut entries = match fs::read_dir(&self.results).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, dir = %self.results.display(), "sweep: cannot read results dir");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => DateTime::<Utc>::from(t),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "sweep: cannot stat file");
                    continue;
                }
            };
            if now - modified >= retention {
                debug!(path = %path.display(), "sweep: removing expired result file");
                remove_file(&path).await;
            }
        }
    }
}

/// Best-effort file removal used for bundles, evicted results, and sweep
/// targets. Missing files are fine; anything else is logged.
pub async fn remove_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}
