//! Supervision of the external Whisper CLI.
//!
//! The child runs with default verbosity and its stderr is consumed
//! line-by-line while it executes, both so progress reaches the server log
//! in real time and so the pipe buffer can never fill up and deadlock the
//! child. stdout is drained in bulk on a separate task for the same reason.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many trailing stderr lines are kept for failure reports.
pub const STDERR_TAIL_LINES: usize = 50;

/// Grace period between the polite terminate signal and the forceful kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("failed to spawn transcriber '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcriber exited with {status}; stderr tail:\n{tail}")]
    Exit { status: String, tail: String },

    #[error("transcriber produced no subtitle output for '{stem}'")]
    NoOutput { stem: String },

    #[error("transcriber produced {count} subtitle files for '{stem}'")]
    AmbiguousOutput { stem: String, count: usize },

    #[error("transcription cancelled")]
    Cancelled,

    #[error("i/o error while supervising transcriber: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscribeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "transcriber.spawn",
            Self::Exit { .. } => "transcriber.exit",
            Self::NoOutput { .. } => "transcriber.no_output",
            Self::AmbiguousOutput { .. } => "transcriber.ambiguous_output",
            Self::Cancelled => "task.cancelled",
            Self::Io(_) => "transcriber.io",
        }
    }
}

/// Drives one transcription subprocess at a time. Serialization across tasks
/// is the worker loop's job, not this type's.
#[derive(Debug, Clone)]
pub struct TranscriberDriver {
    binary: String,
    grace: Duration,
}

impl TranscriberDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            grace: KILL_GRACE,
        }
    }

    #[cfg(test)]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Transcribe `audio` into `output_dir` and return the produced SRT path.
    ///
    /// Cancellation terminates the child gracefully first; if it is still
    /// alive after the grace period it is killed outright.
    pub async fn transcribe(
        &self,
        audio: &Path,
        model: &str,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TranscribeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(audio)
            .args(["--model", model])
            .arg("--output_dir")
            .arg(output_dir)
            .args(["--output_format", "srt"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.binary, audio = %audio.display(), model, "spawning transcriber");
        let mut child = cmd.spawn().map_err(|source| TranscribeError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut buf).await;
            }
            buf
        });

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscribeError::Io(std::io::Error::other("stderr not captured")))?;
        let mut lines = BufReader::new(stderr).lines();

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut terminated = false;
        let mut force_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !terminated => {
                    info!("cancellation requested; terminating transcriber");
                    terminate(&mut child);
                    terminated = true;
                    force_at = Some(Instant::now() + self.grace);
                }
                _ = sleep_until_opt(force_at), if force_at.is_some() => {
                    warn!("transcriber ignored terminate signal; killing");
                    let _ = child.start_kill();
                    force_at = None;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        info!(target: "murmur::transcriber", "{line}");
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "transcriber stderr read failed");
                        break;
                    }
                },
            }
        }

        let status = child.wait().await?;
        match stdout_task.await {
            Ok(buf) if !buf.is_empty() => {
                debug!(bytes = buf.len(), "transcriber stdout captured")
            }
            _ => {}
        }

        if terminated {
            return Err(TranscribeError::Cancelled);
        }
        if !status.success() {
            return Err(TranscribeError::Exit {
                status: status.to_string(),
                tail: tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            });
        }

        locate_output(output_dir, audio)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Ask the child to exit. On unix this is SIGTERM so the transcriber can
/// flush partial state; elsewhere there is only the hard kill.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal send to a pid we own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

/// Find the single SRT the transcriber wrote for this audio file. The CLI
/// names its output after the input basename, sometimes with an inserted
/// language tag, so anything whose stem starts with the audio stem counts.
fn locate_output(output_dir: &Path, audio: &Path) -> Result<PathBuf, TranscribeError> {
    let stem = audio
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut matches = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        let is_srt = path.extension().and_then(|e| e.to_str()) == Some("srt");
        let stem_matches = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.starts_with(stem.as_str()));
        if is_srt && stem_matches {
            matches.push(path);
        }
    }

    match matches.len() {
        0 => Err(TranscribeError::NoOutput { stem }),
        1 => Ok(matches.remove(0)),
        count => Err(TranscribeError::AmbiguousOutput { stem, count }),
    }
}
