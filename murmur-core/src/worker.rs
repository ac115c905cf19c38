//! Single-consumer transcription worker and the retention sweeper.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use crate::bundle::{self, BundleError};
use crate::registry::{ClaimedTask, TaskRegistry};
use crate::store::{self, ArtifactStore, StoreError};
use crate::transcriber::{TranscribeError, TranscriberDriver};
use crate::types::{ResultDescriptor, TaskFailure};

/// The single consumer of the task queue.
///
/// Runs for the lifetime of the server; a failure in one task is recorded on
/// that task and never escapes the iteration.
pub struct Worker {
    registry: Arc<TaskRegistry>,
    store: Arc<ArtifactStore>,
    driver: TranscriberDriver,
    retention: Duration,
}

impl Worker {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<ArtifactStore>,
        driver: TranscriberDriver,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            driver,
            retention,
        }
    }

    pub async fn run(self) {
        info!("transcription worker started");
        loop {
            while let Some(claim) = self.registry.claim_next() {
                self.process(claim).await;
            }
            self.registry.wait_for_work().await;
        }
    }

    async fn process(&self, claim: ClaimedTask) {
        let task_id = claim.id.clone();

        // Cancellation that raced in between admit and claim.
        if claim.cancel.is_cancelled() {
            info!(task_id = %task_id, "task cancelled before start; skipping");
            if let Err(e) = self.registry.finish_cancelled(&task_id) {
                warn!(task_id = %task_id, error = %e, "could not record cancellation");
            }
            self.cleanup(&claim).await;
            return;
        }

        info!(task_id = %task_id, model = %claim.model, "processing task");
        match self.run_task(&claim).await {
            Ok(result) => {
                info!(task_id = %task_id, size_bytes = result.size_bytes, "task completed");
                if let Err(e) = self.registry.complete(&task_id, result) {
                    warn!(task_id = %task_id, error = %e, "could not record completion");
                }
            }
            Err(TaskRunError::Cancelled) => {
                info!(task_id = %task_id, "task cancelled while running");
                if let Err(e) = self.registry.finish_cancelled(&task_id) {
                    warn!(task_id = %task_id, error = %e, "could not record cancellation");
                }
            }
            Err(err) => {
                let failure = err.into_failure();
                error!(task_id = %task_id, code = %failure.code, detail = %failure.message, "task failed");
                if let Err(e) = self.registry.fail(&task_id, failure) {
                    warn!(task_id = %task_id, error = %e, "could not record failure");
                }
            }
        }
        self.cleanup(&claim).await;
    }

    async fn run_task(&self, claim: &ClaimedTask) -> Result<ResultDescriptor, TaskRunError> {
        let workdir = self.store.open_workdir(&claim.id).await?;

        let bytes = tokio::fs::read(&claim.bundle_path)
            .await
            .map_err(|source| StoreError::Io {
                path: claim.bundle_path.clone(),
                source,
            })?;

        // Decrypt + inflate is CPU work; keep it off the runtime threads.
        let key = claim.bundle_key.clone();
        let unpack_dir = workdir.clone();
        let (metadata, audio_path) =
            tokio::task::spawn_blocking(move || bundle::unpack(&bytes, &key, &unpack_dir))
                .await
                .map_err(|e| TaskRunError::Internal(format!("unpack task panicked: {e}")))??;

        if metadata.task_id != claim.id {
            warn!(
                task_id = %claim.id,
                metadata_task_id = %metadata.task_id,
                "bundle metadata id differs from submission id"
            );
        }

        let srt_path = self
            .driver
            .transcribe(&audio_path, &claim.model, &workdir, &claim.cancel)
            .await
            .map_err(|e| match e {
                TranscribeError::Cancelled => TaskRunError::Cancelled,
                other => TaskRunError::Transcribe(other),
            })?;

        let result = self
            .store
            .publish_result(&claim.id, &srt_path, self.retention)
            .await?;
        Ok(result)
    }

    /// Runs for every claimed task, whatever the outcome: the scratch
    /// directory and the inbound bundle are gone afterwards.
    async fn cleanup(&self, claim: &ClaimedTask) {
        self.store.drop_workdir(&claim.id).await;
        store::remove_file(&claim.bundle_path).await;
    }
}

enum TaskRunError {
    Bundle(BundleError),
    Transcribe(TranscribeError),
    Storage(StoreError),
    Cancelled,
    Internal(String),
}

impl From<BundleError> for TaskRunError {
    fn from(e: BundleError) -> Self {
        Self::Bundle(e)
    }
}

impl From<StoreError> for TaskRunError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl TaskRunError {
    fn into_failure(self) -> TaskFailure {
        match self {
            Self::Bundle(e) => TaskFailure::new(e.code(), e.to_string()),
            Self::Transcribe(e) => TaskFailure::new(e.code(), e.to_string()),
            Self::Storage(e) => TaskFailure::new(e.code(), e.to_string()),
            Self::Cancelled => TaskFailure::new("task.cancelled", "task cancelled"),
            Self::Internal(m) => TaskFailure::new("internal", m),
        }
    }
}

/// Periodic retention sweep: evicts expired task records and removes their
/// files, then lets the store clear orphans. Interval is `retention / 24`,
/// clamped to [1 minute, 1 hour].
pub async fn run_sweeper(
    registry: Arc<TaskRegistry>,
    store: Arc<ArtifactStore>,
    retention: Duration,
) {
    let secs = (retention.num_seconds().max(60) as u64 / 24).clamp(60, 3600);
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(secs));
    ticker.tick().await; // first tick fires immediately; skip it

    info!(interval_secs = secs, "retention sweeper started");
    loop {
        ticker.tick().await;
        let now = Utc::now();
        for (task_id, evicted) in registry.evict_expired(now, retention) {
            info!(task_id = %task_id, "retention sweep removed expired task");
            if let Some(path) = evicted.result_path {
                store::remove_file(&path).await;
            }
            if let Some(path) = evicted.bundle_path {
                store::remove_file(&path).await;
            }
        }
        store.sweep(now, retention).await;
    }
}
