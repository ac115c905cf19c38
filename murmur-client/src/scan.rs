//! Video discovery and skip logic.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Extensions treated as video input, matched case-insensitively.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "flv", "m4v", "webm"];

/// Recursively enumerate video files under `root` in stable (sorted) order.
pub fn scan_videos(root: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_video(path))
        .collect();
    videos.sort();
    videos
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
}

/// A video is done when a sibling `{stem}.srt` already exists.
pub fn has_sibling_subtitle(video: &Path) -> bool {
    video.with_extension("srt").exists()
}

/// Where the finished subtitle belongs: next to the video, or in the
/// configured output directory under the video's stem.
pub fn subtitle_target(video: &Path, output_dir: Option<&Path>) -> PathBuf {
    match output_dir {
        Some(dir) => {
            let stem = video.file_stem().unwrap_or_default();
            dir.join(stem).with_extension("srt")
        }
        None => video.with_extension("srt"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn scan_finds_nested_videos_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b/two.mkv"));
        touch(&dir.path().join("a/one.MP4"));
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("a/clip.ogg"));

        let videos = scan_videos(dir.path());
        assert_eq!(
            videos,
            vec![dir.path().join("a/one.MP4"), dir.path().join("b/two.mkv")]
        );
    }

    #[test]
    fn sibling_subtitle_marks_video_done() {
        let dir = TempDir::new().unwrap();
        let video = dir.path().join("film.mp4");
        touch(&video);
        assert!(!has_sibling_subtitle(&video));

        touch(&dir.path().join("film.srt"));
        assert!(has_sibling_subtitle(&video));
    }

    #[test]
    fn subtitle_target_honors_output_dir() {
        let video = Path::new("/media/show/e01.mkv");
        assert_eq!(
            subtitle_target(video, None),
            PathBuf::from("/media/show/e01.srt")
        );
        assert_eq!(
            subtitle_target(video, Some(Path::new("/subs"))),
            PathBuf::from("/subs/e01.srt")
        );
    }
}
