use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::bundle::{self, BundleError, BundleMetadata};
use crate::registry::{AdmitError, CancelOutcome, TaskRegistry};
use crate::store::ArtifactStore;
use crate::transcriber::{TranscribeError, TranscriberDriver};
use crate::types::{ResultDescriptor, TaskFailure, TaskState};
use crate::worker::Worker;

const PASSWORD: &str = "test-bundle-password";

fn write_audio(dir: &Path) -> PathBuf {
    let path = dir.join("clip.ogg");
    std::fs::write(&path, b"OggS\x00fake-opus-payload-for-tests").unwrap();
    path
}

/// Drop a fake transcriber CLI into `dir`. The script accepts the real
/// argument surface (`<audio> --model m --output_dir d --output_format srt`)
/// and runs `body` with `$audio`, `$outdir`, and `$stem` in scope.
#[cfg(unix)]
fn write_stub_transcriber(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        r#"#!/bin/sh
audio="$1"; shift
outdir="."
while [ $# -gt 0 ]; do
  case "$1" in
    --output_dir) outdir="$2"; shift 2;;
    --model|--output_format) shift 2;;
    *) shift;;
  esac
done
stem=$(basename "$audio")
stem="${{stem%.*}}"
{body}
"#
    );
    let path = dir.join("stub-whisper");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
const STUB_OK: &str = r#"echo "loading model" >&2
echo "transcribing $stem" >&2
printf '1\n00:00:00,000 --> 00:00:01,000\nhello world\n' > "$outdir/$stem.srt"
"#;

#[cfg(unix)]
async fn wait_for_state(registry: &TaskRegistry, id: &str, want: TaskState) -> TaskState {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Some(snapshot) = registry.status(id) {
                if snapshot.state == want {
                    return snapshot.state;
                }
                assert!(
                    !snapshot.state.is_terminal() || snapshot.state == want,
                    "task {id} reached unexpected terminal state {:?}",
                    snapshot.state
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {want:?}"))
}

fn descriptor(expires_in_secs: i64) -> ResultDescriptor {
    let now = Utc::now();
    ResultDescriptor {
        path: PathBuf::from("/nonexistent/r.srt"),
        size_bytes: 42,
        created_at: now,
        expires_at: now + chrono::Duration::seconds(expires_in_secs),
    }
}

// ── Bundle codec ──────────────────────────────────────────────────────────────

#[test]
fn bundle_round_trip_preserves_metadata_and_audio() {
    let dir = TempDir::new().unwrap();
    let audio = write_audio(dir.path());
    let metadata = BundleMetadata::new("task-1", "large-v3-turbo");

    let bytes = bundle::pack(&metadata, &audio, PASSWORD).unwrap();
    let out = TempDir::new().unwrap();
    let (decoded, audio_path) = bundle::unpack(&bytes, PASSWORD, out.path()).unwrap();

    assert_eq!(decoded, metadata);
    assert_eq!(
        std::fs::read(&audio_path).unwrap(),
        std::fs::read(&audio).unwrap()
    );
}

#[test]
fn bundle_pack_fails_on_missing_audio() {
    let metadata = BundleMetadata::new("task-1", "base");
    let err = bundle::pack(&metadata, Path::new("/nonexistent/audio.ogg"), PASSWORD).unwrap_err();
    assert!(matches!(err, BundleError::Encoding(_)), "got {err:?}");
}

#[test]
fn bundle_wrong_password_is_auth_error() {
    let dir = TempDir::new().unwrap();
    let audio = write_audio(dir.path());
    let bytes = bundle::pack(&BundleMetadata::new("t", "base"), &audio, PASSWORD).unwrap();

    let out = TempDir::new().unwrap();
    let err = bundle::unpack(&bytes, "not-the-password", out.path()).unwrap_err();
    assert!(matches!(err, BundleError::Auth), "got {err:?}");
}

#[test]
fn bundle_tamper_is_detected() {
    let dir = TempDir::new().unwrap();
    let audio = write_audio(dir.path());
    let mut bytes = bundle::pack(&BundleMetadata::new("t", "base"), &audio, PASSWORD).unwrap();

    // Flip one byte in the middle of the container.
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;

    let out = TempDir::new().unwrap();
    let err = bundle::unpack(&bytes, PASSWORD, out.path()).unwrap_err();
    assert!(
        matches!(
            err,
            BundleError::Auth | BundleError::Format(_) | BundleError::Schema(_)
        ),
        "tampering must not yield usable output, got {err:?}"
    );
}

#[test]
fn bundle_unsupported_version_is_schema_error() {
    let dir = TempDir::new().unwrap();
    let audio = write_audio(dir.path());
    let mut metadata = BundleMetadata::new("t", "base");
    metadata.version = 99;
    let bytes = bundle::pack(&metadata, &audio, PASSWORD).unwrap();

    let out = TempDir::new().unwrap();
    let err = bundle::unpack(&bytes, PASSWORD, out.path()).unwrap_err();
    assert!(matches!(err, BundleError::Schema(_)), "got {err:?}");
}

#[test]
fn bundle_rejects_unexpected_member_count() {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    // An archive with only a metadata member is structurally invalid.
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .with_aes_encryption(zip::AesMode::Aes256, PASSWORD);
    writer.start_file("metadata.json", options).unwrap();
    writer
        .write_all(br#"{"task_id":"t","model":"base","version":1}"#)
        .unwrap();
    let bytes = writer.finish().unwrap().into_inner();

    let out = TempDir::new().unwrap();
    let err = bundle::unpack(&bytes, PASSWORD, out.path()).unwrap_err();
    assert!(matches!(err, BundleError::Format(_)), "got {err:?}");
}

// ── Registry: admission, queueing, transitions ────────────────────────────────

fn admit(registry: &TaskRegistry, id: &str) -> Result<(), AdmitError> {
    registry
        .admit(
            id.to_owned(),
            "base".to_owned(),
            PathBuf::from(format!("/uploads/{id}.bundle")),
            PASSWORD.to_owned(),
        )
        .map(|_| ())
}

#[test]
fn admission_is_bounded_by_capacity() {
    let registry = TaskRegistry::new(2);
    admit(&registry, "a").unwrap();
    admit(&registry, "b").unwrap();

    let err = admit(&registry, "c").unwrap_err();
    match err {
        AdmitError::PoolFull(pool) => {
            assert!(pool.is_full);
            assert_eq!(pool.current_size, 2);
            assert_eq!(pool.max_size, 2);
        }
        other => panic!("expected PoolFull, got {other:?}"),
    }
}

#[test]
fn processing_counts_toward_capacity() {
    let registry = TaskRegistry::new(1);
    admit(&registry, "a").unwrap();
    let claim = registry.claim_next().unwrap();
    assert_eq!(claim.id, "a");

    // Still full: one task is processing.
    assert!(matches!(
        admit(&registry, "b").unwrap_err(),
        AdmitError::PoolFull(_)
    ));
    let pool = registry.pool_view();
    assert_eq!(pool.processing_count, 1);
    assert!(pool.is_full);

    registry.complete("a", descriptor(3600)).unwrap();
    admit(&registry, "b").unwrap();
}

#[test]
fn duplicate_in_flight_id_conflicts() {
    let registry = TaskRegistry::new(4);
    admit(&registry, "dup").unwrap();
    assert!(matches!(
        admit(&registry, "dup").unwrap_err(),
        AdmitError::Conflict
    ));

    // Also conflicts while processing.
    registry.claim_next().unwrap();
    assert!(matches!(
        admit(&registry, "dup").unwrap_err(),
        AdmitError::Conflict
    ));
}

#[test]
fn terminal_task_is_replaced_on_resubmission() {
    let registry = TaskRegistry::new(4);
    admit(&registry, "r").unwrap();
    registry.claim_next().unwrap();
    registry.complete("r", descriptor(3600)).unwrap();

    let evicted = registry
        .admit(
            "r".to_owned(),
            "base".to_owned(),
            PathBuf::from("/uploads/r.2.bundle"),
            PASSWORD.to_owned(),
        )
        .unwrap()
        .expect("old record should be evicted");
    assert_eq!(evicted.result_path, Some(PathBuf::from("/nonexistent/r.srt")));

    let snapshot = registry.status("r").unwrap();
    assert_eq!(snapshot.state, TaskState::Queued);
}

#[test]
fn claims_come_out_in_admission_order() {
    let registry = TaskRegistry::new(8);
    for id in ["first", "second", "third"] {
        admit(&registry, id).unwrap();
    }
    assert_eq!(registry.claim_next().unwrap().id, "first");
    registry.complete("first", descriptor(3600)).unwrap();
    assert_eq!(registry.claim_next().unwrap().id, "second");
    registry.complete("second", descriptor(3600)).unwrap();
    assert_eq!(registry.claim_next().unwrap().id, "third");
}

#[test]
fn claim_skips_tasks_cancelled_while_queued() {
    let registry = TaskRegistry::new(8);
    admit(&registry, "keep").unwrap();
    admit(&registry, "drop").unwrap();

    match registry.cancel("drop").unwrap() {
        CancelOutcome::Cancelled(_) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }

    assert_eq!(registry.claim_next().unwrap().id, "keep");
    registry.complete("keep", descriptor(3600)).unwrap();
    assert!(registry.claim_next().is_none());
    assert_eq!(registry.status("drop").unwrap().state, TaskState::Cancelled);
}

#[test]
fn terminal_transitions_are_idempotent_and_exclusive() {
    let registry = TaskRegistry::new(4);
    admit(&registry, "t").unwrap();
    registry.claim_next().unwrap();

    registry.complete("t", descriptor(3600)).unwrap();
    // Repeating the same outcome is a no-op.
    registry.complete("t", descriptor(3600)).unwrap();
    // A different terminal outcome is an error.
    let err = registry
        .fail("t", TaskFailure::new("transcriber.exit", "boom"))
        .unwrap_err();
    assert!(err.to_string().contains("invalid transition"));
    assert_eq!(registry.status("t").unwrap().state, TaskState::Completed);
}

#[test]
fn cancel_is_idempotent_on_terminal_tasks() {
    let registry = TaskRegistry::new(4);
    admit(&registry, "t").unwrap();
    assert!(matches!(
        registry.cancel("t").unwrap(),
        CancelOutcome::Cancelled(_)
    ));
    assert!(matches!(
        registry.cancel("t").unwrap(),
        CancelOutcome::AlreadyTerminal
    ));
}

#[test]
fn expired_records_are_evicted() {
    let registry = TaskRegistry::new(4);
    admit(&registry, "old").unwrap();
    registry.claim_next().unwrap();
    registry.complete("old", descriptor(-5)).unwrap();

    let evicted = registry.evict_expired(Utc::now(), chrono::Duration::hours(24));
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].0, "old");
    assert!(registry.status("old").is_none());
}

#[test]
fn fresh_results_survive_the_sweep() {
    let registry = TaskRegistry::new(4);
    admit(&registry, "fresh").unwrap();
    registry.claim_next().unwrap();
    registry.complete("fresh", descriptor(3600)).unwrap();

    let evicted = registry.evict_expired(Utc::now(), chrono::Duration::hours(24));
    assert!(evicted.is_empty());
    assert!(registry.result("fresh").is_some());
}

// ── Artifact store ────────────────────────────────────────────────────────────

#[tokio::test]
async fn put_bundle_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::open(
        dir.path().join("uploads"),
        dir.path().join("work"),
        dir.path().join("results"),
    )
    .await
    .unwrap();

    let path = store.put_bundle("t1", b"bundle-bytes").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"bundle-bytes");

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("uploads"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

#[tokio::test]
async fn workdir_refuses_reuse_until_dropped() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::open(
        dir.path().join("uploads"),
        dir.path().join("work"),
        dir.path().join("results"),
    )
    .await
    .unwrap();

    let workdir = store.open_workdir("t1").await.unwrap();
    assert!(workdir.is_dir());
    assert!(store.open_workdir("t1").await.is_err());

    store.drop_workdir("t1").await;
    store.drop_workdir("t1").await; // idempotent
    store.open_workdir("t1").await.unwrap();
}

#[tokio::test]
async fn publish_result_is_atomic_and_stamped() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::open(
        dir.path().join("uploads"),
        dir.path().join("work"),
        dir.path().join("results"),
    )
    .await
    .unwrap();

    let srt = dir.path().join("raw.srt");
    std::fs::write(&srt, "1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();

    let result = store
        .publish_result("t1", &srt, chrono::Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(result.path.parent(), Some(dir.path().join("results").as_path()));
    assert!(result.path.is_file());
    assert_eq!(result.size_bytes, std::fs::metadata(&result.path).unwrap().len());
    assert!(result.expires_at > result.created_at);

    // No half-published temp file remains next to it.
    let names: Vec<String> = std::fs::read_dir(dir.path().join("results"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".srt"), "unexpected name {names:?}");

    store.delete_result("t1").await;
    store.delete_result("t1").await; // idempotent
    assert!(!result.path.exists());
}

#[tokio::test]
async fn hazardous_task_ids_stay_inside_the_roots() {
    let dir = TempDir::new().unwrap();
    let uploads = dir.path().join("uploads");
    let results = dir.path().join("results");
    let store = ArtifactStore::open(&uploads, dir.path().join("work"), &results)
        .await
        .unwrap();

    // Printable ASCII ids may carry separators, traversal, and quotes.
    let id = "job:42/../../etc passwd \"x\"";

    let bundle = store.put_bundle(id, b"bytes").await.unwrap();
    assert_eq!(bundle.parent(), Some(uploads.as_path()));
    assert!(bundle.is_file());

    let workdir = store.open_workdir(id).await.unwrap();
    assert_eq!(workdir.parent(), Some(dir.path().join("work").as_path()));
    store.drop_workdir(id).await;
    assert!(!workdir.exists());

    let srt = dir.path().join("raw.srt");
    std::fs::write(&srt, "1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();
    let result = store
        .publish_result(id, &srt, chrono::Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(result.path.parent(), Some(results.as_path()));
    assert!(result.path.is_file());

    // Deletion recomputes the same on-disk name from the raw id.
    store.delete_result(id).await;
    assert!(!result.path.exists());
}

// ── Transcriber driver (stub subprocess) ──────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn driver_collects_the_produced_srt() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcriber(dir.path(), STUB_OK);
    let audio = write_audio(dir.path());
    let out = TempDir::new().unwrap();

    let driver = TranscriberDriver::new(stub.to_string_lossy());
    let srt = driver
        .transcribe(&audio, "base", out.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(srt, out.path().join("clip.srt"));
    assert!(std::fs::read_to_string(&srt).unwrap().contains("hello world"));
}

#[cfg(unix)]
#[tokio::test]
async fn driver_reports_exit_code_with_stderr_tail() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcriber(
        dir.path(),
        r#"echo "fatal: model exploded" >&2
exit 3
"#,
    );
    let audio = write_audio(dir.path());
    let out = TempDir::new().unwrap();

    let driver = TranscriberDriver::new(stub.to_string_lossy());
    let err = driver
        .transcribe(&audio, "base", out.path(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        TranscribeError::Exit { tail, .. } => {
            assert!(tail.contains("model exploded"), "tail was: {tail}")
        }
        other => panic!("expected Exit, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn driver_detects_missing_output() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcriber(dir.path(), r#"echo "done" >&2"#);
    let audio = write_audio(dir.path());
    let out = TempDir::new().unwrap();

    let driver = TranscriberDriver::new(stub.to_string_lossy());
    let err = driver
        .transcribe(&audio, "base", out.path(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TranscribeError::NoOutput { .. }), "got {err:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn driver_detects_ambiguous_output() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcriber(
        dir.path(),
        r#"printf 'x' > "$outdir/$stem.srt"
printf 'x' > "$outdir/$stem.en.srt"
"#,
    );
    let audio = write_audio(dir.path());
    let out = TempDir::new().unwrap();

    let driver = TranscriberDriver::new(stub.to_string_lossy());
    let err = driver
        .transcribe(&audio, "base", out.path(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, TranscribeError::AmbiguousOutput { count: 2, .. }),
        "got {err:?}"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn driver_terminates_child_on_cancellation() {
    let dir = TempDir::new().unwrap();
    let stub = write_stub_transcriber(
        dir.path(),
        r#"echo "working" >&2
exec sleep 30
"#,
    );
    let audio = write_audio(dir.path());
    let out = TempDir::new().unwrap();

    let driver = TranscriberDriver::new(stub.to_string_lossy())
        .with_grace(Duration::from_millis(500));
    let cancel = CancellationToken::new();
    let cancel_handle = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_handle.cancel();
    });

    let started = std::time::Instant::now();
    let err = driver
        .transcribe(&audio, "base", out.path(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TranscribeError::Cancelled), "got {err:?}");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "cancellation took too long: {:?}",
        started.elapsed()
    );
}

// ── Worker loop end-to-end ────────────────────────────────────────────────────

#[cfg(unix)]
struct Harness {
    _dir: TempDir,
    registry: Arc<TaskRegistry>,
    store: Arc<ArtifactStore>,
    audio: PathBuf,
    uploads: PathBuf,
    work: PathBuf,
}

#[cfg(unix)]
impl Harness {
    async fn start(capacity: usize, stub_body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let stub = write_stub_transcriber(dir.path(), stub_body);
        let audio = write_audio(dir.path());
        let uploads = dir.path().join("uploads");
        let work = dir.path().join("work");

        let store = Arc::new(
            ArtifactStore::open(&uploads, &work, dir.path().join("results"))
                .await
                .unwrap(),
        );
        let registry = Arc::new(TaskRegistry::new(capacity));

        let worker = Worker::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            TranscriberDriver::new(stub.to_string_lossy()),
            chrono::Duration::hours(24),
        );
        tokio::spawn(worker.run());

        Self {
            _dir: dir,
            registry,
            store,
            audio,
            uploads,
            work,
        }
    }

    /// Pack a bundle for `id` with `password` and admit it.
    async fn submit(&self, id: &str, password: &str) {
        let bytes = bundle::pack(&BundleMetadata::new(id, "base"), &self.audio, password).unwrap();
        let path = self.store.put_bundle(id, &bytes).await.unwrap();
        self.registry
            .admit(id.to_owned(), "base".to_owned(), path, PASSWORD.to_owned())
            .unwrap();
    }
}

#[cfg(unix)]
#[tokio::test]
async fn worker_happy_path_produces_a_result() {
    let h = Harness::start(2, STUB_OK).await;
    h.submit("happy", PASSWORD).await;

    wait_for_state(&h.registry, "happy", TaskState::Completed).await;

    let result = h.registry.result("happy").expect("descriptor present");
    assert!(result.size_bytes > 0);
    assert!(result.path.is_file());
    assert!(
        std::fs::read_to_string(&result.path)
            .unwrap()
            .contains("hello world")
    );

    // Inbound bundle and scratch directory are gone.
    assert_eq!(std::fs::read_dir(&h.uploads).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(&h.work).unwrap().count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn worker_marks_wrong_password_bundle_failed() {
    let h = Harness::start(2, STUB_OK).await;
    // Packed with a different password than the submission key.
    h.submit("corrupt", "some-other-password").await;

    wait_for_state(&h.registry, "corrupt", TaskState::Failed).await;

    let snapshot = h.registry.status("corrupt").unwrap();
    let failure = snapshot.error.expect("failure recorded");
    assert_eq!(failure.code, "bundle.auth");
    assert_eq!(std::fs::read_dir(&h.work).unwrap().count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn cancel_while_queued_is_skipped_by_the_worker() {
    let slow = r#"sleep 1
printf '1\n00:00:00,000 --> 00:00:01,000\nok\n' > "$outdir/$stem.srt"
"#;
    let h = Harness::start(4, slow).await;
    h.submit("busy", PASSWORD).await;
    h.submit("doomed", PASSWORD).await;

    // The worker is occupied with "busy" for ~1s; cancel the queued task.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        h.registry.cancel("doomed").unwrap(),
        CancelOutcome::Cancelled(_)
    ));

    wait_for_state(&h.registry, "busy", TaskState::Completed).await;
    assert_eq!(
        h.registry.status("doomed").unwrap().state,
        TaskState::Cancelled
    );
    assert!(h.registry.result("doomed").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn worker_processes_tasks_in_submission_order() {
    let h = Harness::start(4, STUB_OK).await;
    h.submit("one", PASSWORD).await;
    h.submit("two", PASSWORD).await;

    wait_for_state(&h.registry, "one", TaskState::Completed).await;
    wait_for_state(&h.registry, "two", TaskState::Completed).await;

    let one = h.registry.status("one").unwrap();
    let two = h.registry.status("two").unwrap();
    assert!(
        one.started_at.unwrap() <= two.started_at.unwrap(),
        "earlier submission must start first"
    );
}
