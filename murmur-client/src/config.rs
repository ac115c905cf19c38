//! Client configuration, loaded from environment variables at startup.

use std::path::PathBuf;

use anyhow::{bail, Result};

/// Runtime configuration for murmur-client.
///
/// Only `MURMUR_SCAN_DIR` is required; everything else has a default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the murmur server (default `"http://localhost:8000"`).
    pub server_url: String,

    /// Directory tree to scan for video files.
    pub scan_dir: PathBuf,

    /// Where to write subtitles; `None` means next to each video.
    pub output_dir: Option<PathBuf>,

    /// Whisper model requested for every task (default `"large-v3-turbo"`).
    pub model: String,

    /// Shared bundle password.
    pub password: String,

    /// Poll interval while a task is queued (default 15 s).
    pub pending_poll_secs: u64,

    /// Poll interval while a task is processing (default 5 s).
    pub processing_poll_secs: u64,

    /// Back-off while the server pool is full (default 5 s).
    pub submit_backoff_secs: u64,

    /// Give up waiting on a single task after this many seconds; 0 waits
    /// forever (default 0).
    pub wait_ceiling_secs: u64,

    /// Keep converted audio and bundles instead of deleting them.
    pub keep_files: bool,

    /// Scratch directory for converted audio and packed bundles.
    pub scratch_dir: PathBuf,

    /// `tracing` filter string.
    pub log_level: String,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let Some(scan_dir) = std::env::var_os("MURMUR_SCAN_DIR") else {
            bail!("MURMUR_SCAN_DIR must point at the directory to scan");
        };

        Ok(Self {
            server_url: env_or("MURMUR_SERVER", "http://localhost:8000"),
            scan_dir: PathBuf::from(scan_dir),
            output_dir: std::env::var_os("MURMUR_OUTPUT_DIR").map(PathBuf::from),
            model: env_or("MURMUR_MODEL", "large-v3-turbo"),
            password: env_or("MURMUR_BUNDLE_PASSWORD", "murmur-task-password"),
            pending_poll_secs: parse_env("MURMUR_PENDING_POLL_SECS", 15),
            processing_poll_secs: parse_env("MURMUR_PROCESSING_POLL_SECS", 5),
            submit_backoff_secs: parse_env("MURMUR_SUBMIT_BACKOFF_SECS", 5),
            wait_ceiling_secs: parse_env("MURMUR_WAIT_CEILING_SECS", 0),
            keep_files: env_flag("MURMUR_KEEP_FILES"),
            scratch_dir: PathBuf::from(env_or("MURMUR_SCRATCH_DIR", "murmur-scratch")),
            log_level: env_or("MURMUR_LOG", "info"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
