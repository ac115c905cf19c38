//! Video → normalized audio conversion via the external ffmpeg binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fixed encoder surface: no video stream, Opus, 16 kHz, mono, 24 kbps.
/// Whisper resamples to 16 kHz mono anyway, so anything richer is wasted
/// upload bandwidth.
pub const ENCODE_ARGS: &[&str] = &[
    "-vn", "-acodec", "libopus", "-ar", "16000", "-ac", "1", "-b:a", "24k",
];

/// Verify ffmpeg is runnable before the batch starts.
pub async fn check_ffmpeg() -> bool {
    match Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(error = %e, "ffmpeg not runnable");
            false
        }
    }
}

/// Convert one video into an `.ogg` in `scratch`, returning the audio path.
/// The encoder writes to a temp name that is renamed only on success, so a
/// crashed conversion never leaves a plausible-looking audio file around.
pub async fn convert_to_audio(video: &Path, scratch: &Path) -> Result<PathBuf> {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce = short_nonce();
    let audio_path = scratch.join(format!("{}_{nonce}.ogg", sanitize_stem(&stem)));
    let temp_path = scratch.join(format!("temp_{nonce}.ogg"));

    debug!(video = %video.display(), audio = %audio_path.display(), "converting");

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(video)
        .args(ENCODE_ARGS)
        .arg("-y")
        .arg(&temp_path)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to run ffmpeg")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
        let _ = std::fs::remove_file(&temp_path);
        bail!(
            "ffmpeg failed on {} ({}): {}",
            video.display(),
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join("\n")
        );
    }

    tokio::fs::rename(&temp_path, &audio_path)
        .await
        .with_context(|| format!("cannot finalize {}", audio_path.display()))?;
    Ok(audio_path)
}

/// Keep scratch file names short and boring whatever the video was called.
fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .take(20)
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim().to_owned();
    if cleaned.is_empty() {
        "clip".to_owned()
    } else {
        cleaned
    }
}

fn short_nonce() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encoder_surface_is_pinned() {
        // The server-side transcriber expects exactly this normalization.
        assert_eq!(
            ENCODE_ARGS,
            &["-vn", "-acodec", "libopus", "-ar", "16000", "-ac", "1", "-b:a", "24k"]
        );
    }

    #[test]
    fn sanitize_drops_awkward_characters() {
        assert_eq!(sanitize_stem("Movie (2024) [x265]!"), "Movie 2024 x265");
        assert_eq!(sanitize_stem("日本語タイトル"), "日本語タイトル");
        assert_eq!(sanitize_stem("///"), "clip");
        assert!(sanitize_stem(&"long".repeat(30)).len() <= 20);
    }

    #[test]
    fn nonce_is_short_hex() {
        let nonce = short_nonce();
        assert_eq!(nonce.len(), 8);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
