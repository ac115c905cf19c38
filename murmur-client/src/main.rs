//! murmur-client – batch driver.
//!
//! Scans a directory tree for videos, converts each to normalized Opus
//! audio, packs an encrypted bundle, submits it while respecting server
//! capacity, and hands every accepted task to a background waiter. The
//! conversion/submission loop is serial; waiters run concurrently and are
//! drained before exit. A per-file failure is logged and skipped rather
//! than aborting the batch, and interrupted runs resume safely because
//! finished videos already have a sibling `.srt`.

mod api;
mod config;
mod convert;
mod scan;
mod waiter;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use murmur_core::bundle::{self, BundleMetadata};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{ApiClient, SubmitOutcome};
use crate::config::ClientConfig;
use crate::waiter::PollIntervals;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = ClientConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.server_url,
        scan_dir = %cfg.scan_dir.display(),
        model = %cfg.model,
        "murmur-client starting"
    );

    if !convert::check_ffmpeg().await {
        bail!("ffmpeg is not available; install it and retry");
    }

    let api = Arc::new(ApiClient::new(&cfg.server_url)?);
    if !api.health().await.unwrap_or(false) {
        bail!("server {} is not reachable", cfg.server_url);
    }

    tokio::fs::create_dir_all(&cfg.scratch_dir)
        .await
        .with_context(|| format!("cannot create scratch dir {}", cfg.scratch_dir.display()))?;

    let videos = scan::scan_videos(&cfg.scan_dir);
    info!(count = videos.len(), "videos found");

    let intervals = PollIntervals {
        pending: Duration::from_secs(cfg.pending_poll_secs),
        processing: Duration::from_secs(cfg.processing_poll_secs),
    };
    let ceiling = (cfg.wait_ceiling_secs > 0).then(|| Duration::from_secs(cfg.wait_ceiling_secs));

    let mut waiters = Vec::new();
    let mut skipped = 0usize;
    let mut failures = 0usize;

    for video in videos {
        if scan::has_sibling_subtitle(&video) {
            info!(video = %video.display(), "subtitle already present; skipping");
            skipped += 1;
            continue;
        }

        match submit_one(&cfg, &api, &video).await {
            Ok((task_id, audio_path, bundle_path)) => {
                let api = Arc::clone(&api);
                let target = scan::subtitle_target(&video, cfg.output_dir.as_deref());
                let keep_files = cfg.keep_files;
                let video_label = video.display().to_string();

                waiters.push(tokio::spawn(async move {
                    let ok = match waiter::wait_for_result(&api, &task_id, intervals, ceiling)
                        .await
                    {
                        Ok(bytes) => match waiter::save_subtitle(&target, &bytes) {
                            Ok(()) => {
                                info!(video = %video_label, subtitle = %target.display(), "done");
                                true
                            }
                            Err(e) => {
                                error!(video = %video_label, error = %e, "could not save subtitle");
                                false
                            }
                        },
                        Err(e) => {
                            error!(video = %video_label, error = %e, "transcription failed");
                            false
                        }
                    };
                    if !keep_files {
                        remove_scratch(&audio_path);
                        remove_scratch(&bundle_path);
                    }
                    ok
                }));
            }
            Err(e) => {
                error!(video = %video.display(), error = %e, "submission failed; skipping file");
                failures += 1;
            }
        }
    }

    // Drain every outstanding waiter before exiting.
    let submitted = waiters.len();
    for handle in waiters {
        match handle.await {
            Ok(true) => {}
            _ => failures += 1,
        }
    }

    if !cfg.keep_files {
        if let Err(e) = tokio::fs::remove_dir_all(&cfg.scratch_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "could not remove scratch dir");
            }
        }
    }

    info!(submitted, skipped, failures, "batch finished");
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Convert, pack, and submit one video. Returns the accepted task id plus
/// the scratch files the waiter should clean up.
async fn submit_one(
    cfg: &ClientConfig,
    api: &ApiClient,
    video: &Path,
) -> Result<(String, PathBuf, PathBuf)> {
    let audio_path = convert::convert_to_audio(video, &cfg.scratch_dir).await?;

    let task_id = Uuid::new_v4().to_string();
    let metadata = BundleMetadata::new(task_id.as_str(), cfg.model.as_str());
    let password = cfg.password.clone();
    let pack_audio = audio_path.clone();
    let bytes =
        tokio::task::spawn_blocking(move || bundle::pack(&metadata, &pack_audio, &password))
            .await
            .context("bundle packing panicked")??;

    let bundle_path = cfg.scratch_dir.join(format!("{task_id}.bundle"));
    tokio::fs::write(&bundle_path, &bytes)
        .await
        .with_context(|| format!("cannot write {}", bundle_path.display()))?;

    let backoff = Duration::from_secs(cfg.submit_backoff_secs.max(5));
    loop {
        // Ask before pushing: a full pool means the server would reject the
        // upload anyway, so don't ship the bytes just to get a 429.
        let pool = api.pool_status().await?;
        if pool.is_full {
            info!(
                task_id = %task_id,
                current = pool.current_size,
                max = pool.max_size,
                "pool full; backing off"
            );
            tokio::time::sleep(backoff).await;
            continue;
        }

        match api
            .submit(&task_id, &cfg.model, &cfg.password, bytes.clone())
            .await?
        {
            SubmitOutcome::Accepted => {
                info!(task_id = %task_id, video = %video.display(), "task accepted");
                return Ok((task_id, audio_path, bundle_path));
            }
            SubmitOutcome::PoolFull => {
                info!(task_id = %task_id, "pool filled up while submitting; backing off");
                tokio::time::sleep(backoff).await;
            }
            SubmitOutcome::Rejected { status, detail } => {
                bail!("server rejected submission ({status}): {detail}");
            }
        }
    }
}

fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove scratch file");
        }
    }
}
