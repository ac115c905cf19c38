//! State-adaptive polling until a task's subtitle is on disk.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use murmur_core::TaskState;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, DownloadOutcome};

/// How often to poll, by observed task state.
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    pub pending: Duration,
    pub processing: Duration,
}

/// Pick the next sleep. Queued tasks move slowly, so polling them hard only
/// loads the server; a processing task is close to done; a completed one is
/// fetched almost immediately.
pub fn poll_interval(state: Option<TaskState>, intervals: PollIntervals) -> Duration {
    match state {
        Some(TaskState::Processing) => intervals.processing,
        Some(TaskState::Queued) => intervals.pending,
        Some(TaskState::Completed) => Duration::from_secs(2),
        _ => Duration::from_secs(10),
    }
}

/// Poll until the task finishes and return the SRT bytes.
pub async fn wait_for_result(
    api: &ApiClient,
    task_id: &str,
    intervals: PollIntervals,
    ceiling: Option<Duration>,
) -> Result<Vec<u8>> {
    let started = Instant::now();
    let mut missing_strikes = 0u32;
    let mut last_state: Option<TaskState> = None;

    loop {
        if let Some(ceiling) = ceiling {
            if started.elapsed() > ceiling {
                bail!("gave up waiting for task {task_id} after {ceiling:?}");
            }
        }

        let state = match api.status(task_id).await {
            Ok(Some(status)) => {
                missing_strikes = 0;
                if last_state != Some(status.state) {
                    info!(task_id = %task_id, state = %status.state, "task state changed");
                    last_state = Some(status.state);
                }
                match status.state {
                    TaskState::Failed | TaskState::Cancelled => {
                        let detail = status
                            .error
                            .map(|e| format!("{}: {}", e.code, e.message))
                            .unwrap_or_else(|| status.state.to_string());
                        bail!("task {task_id} ended without a result ({detail})");
                    }
                    TaskState::Completed => match api.download(task_id).await? {
                        DownloadOutcome::Ready(bytes) => {
                            info!(
                                task_id = %task_id,
                                bytes = bytes.len(),
                                elapsed_secs = started.elapsed().as_secs(),
                                "subtitle downloaded"
                            );
                            return Ok(bytes);
                        }
                        DownloadOutcome::NotReady => Some(TaskState::Completed),
                        DownloadOutcome::Gone => {
                            bail!("result for task {task_id} expired before download")
                        }
                    },
                    state => Some(state),
                }
            }
            Ok(None) => {
                // The record can only vanish through eviction; tolerate a
                // couple of reads racing a replacement before giving up.
                missing_strikes += 1;
                if missing_strikes >= 3 {
                    bail!("task {task_id} disappeared from the server");
                }
                None
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "status poll failed; will retry");
                None
            }
        };

        let sleep = poll_interval(state, intervals);
        debug!(task_id = %task_id, sleep_secs = sleep.as_secs(), "waiting");
        tokio::time::sleep(sleep).await;
    }
}

/// Write the subtitle atomically next to its final location.
pub fn save_subtitle(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let tmp = target.with_extension("srt.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("cannot write {}", tmp.display()))?;
    std::fs::rename(&tmp, target)
        .with_context(|| format!("cannot finalize {}", target.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    const INTERVALS: PollIntervals = PollIntervals {
        pending: Duration::from_secs(15),
        processing: Duration::from_secs(5),
    };

    #[test]
    fn interval_adapts_to_state() {
        assert_eq!(
            poll_interval(Some(TaskState::Queued), INTERVALS),
            Duration::from_secs(15)
        );
        assert_eq!(
            poll_interval(Some(TaskState::Processing), INTERVALS),
            Duration::from_secs(5)
        );
        assert!(poll_interval(Some(TaskState::Completed), INTERVALS) <= Duration::from_secs(2));
        assert_eq!(poll_interval(None, INTERVALS), Duration::from_secs(10));
    }

    #[test]
    fn save_subtitle_is_atomic_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/show.srt");
        save_subtitle(&target, b"1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();

        assert!(target.is_file());
        assert!(!target.with_extension("srt.tmp").exists());
    }
}
