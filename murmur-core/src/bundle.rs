//! Encrypted task-bundle codec.
//!
//! A bundle is a zip archive with exactly two members, `metadata.json` and
//! `audio.ogg`, both stored as AES-256 encrypted entries. The archive format
//! derives the entry keys from the shared password with a salted, iterated
//! KDF and appends an authentication code per entry, so a wrong password or a
//! flipped byte surfaces as [`BundleError::Auth`] / [`BundleError::Format`]
//! rather than as garbage audio. The `version` field in the metadata pins
//! this parameter set; readers reject versions they do not know.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

/// Archive member holding the task metadata record.
pub const METADATA_NAME: &str = "metadata.json";
/// Archive member holding the normalized audio. The name is fixed wire format.
pub const AUDIO_NAME: &str = "audio.ogg";
/// Current bundle format generation.
pub const BUNDLE_VERSION: u32 = 1;

/// Metadata record carried inside every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub task_id: String,
    pub model: String,
    pub version: u32,
}

impl BundleMetadata {
    pub fn new(task_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            model: model.into(),
            version: BUNDLE_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    /// Pack-side failure: the audio source is missing/unreadable or the
    /// archive could not be produced.
    #[error("bundle encoding failed: {0}")]
    Encoding(String),

    /// Key mismatch or failed entry authentication while unpacking.
    #[error("bundle authentication failed: wrong password or tampered data")]
    Auth,

    /// Metadata member absent, unparseable, or of an unsupported version.
    #[error("bundle metadata invalid: {0}")]
    Schema(String),

    /// Archive structure invalid or the audio member missing/misnamed.
    #[error("bundle format invalid: {0}")]
    Format(String),
}

impl BundleError {
    /// Short machine-readable code recorded on failed tasks.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Encoding(_) => "bundle.encoding",
            Self::Auth => "bundle.auth",
            Self::Schema(_) => "bundle.schema",
            Self::Format(_) => "bundle.format",
        }
    }
}

/// Pack `metadata` and the audio file at `audio_path` into an encrypted
/// archive. The output is not byte-deterministic (per-entry salts vary).
pub fn pack(
    metadata: &BundleMetadata,
    audio_path: &Path,
    password: &str,
) -> Result<Vec<u8>, BundleError> {
    let audio = std::fs::read(audio_path).map_err(|e| {
        BundleError::Encoding(format!("cannot read audio {}: {e}", audio_path.display()))
    })?;
    let metadata_json = serde_json::to_vec_pretty(metadata)
        .map_err(|e| BundleError::Encoding(format!("cannot encode metadata: {e}")))?;

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .with_aes_encryption(AesMode::Aes256, password);

    fn encode_err<E: std::fmt::Display>(e: E) -> BundleError {
        BundleError::Encoding(format!("archive write failed: {e}"))
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(METADATA_NAME, options).map_err(encode_err)?;
    writer.write_all(&metadata_json).map_err(encode_err)?;
    writer.start_file(AUDIO_NAME, options).map_err(encode_err)?;
    writer.write_all(&audio).map_err(encode_err)?;

    let cursor = writer
        .finish()
        .map_err(|e| BundleError::Encoding(format!("archive finish failed: {e}")))?;
    Ok(cursor.into_inner())
}

/// Unpack a bundle into `workdir`, returning the metadata and the path of the
/// extracted audio file. Unpacking the same bytes is deterministic.
pub fn unpack(
    bytes: &[u8],
    password: &str,
    workdir: &Path,
) -> Result<(BundleMetadata, PathBuf), BundleError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| BundleError::Format(format!("not a valid archive: {e}")))?;

    if archive.len() != 2 {
        return Err(BundleError::Format(format!(
            "expected 2 archive members, found {}",
            archive.len()
        )));
    }

    let metadata_bytes = read_member(&mut archive, METADATA_NAME, password).map_err(|e| {
        match e {
            MemberError::Missing => {
                BundleError::Schema(format!("{METADATA_NAME} member missing"))
            }
            other => other.into(),
        }
    })?;
    let metadata: BundleMetadata = serde_json::from_slice(&metadata_bytes)
        .map_err(|e| BundleError::Schema(format!("metadata unparseable: {e}")))?;
    if metadata.version != BUNDLE_VERSION {
        return Err(BundleError::Schema(format!(
            "unsupported bundle version {} (expected {BUNDLE_VERSION})",
            metadata.version
        )));
    }
    if metadata.task_id.is_empty() {
        return Err(BundleError::Schema("metadata task_id is empty".into()));
    }

    let audio = read_member(&mut archive, AUDIO_NAME, password).map_err(|e| match e {
        MemberError::Missing => BundleError::Format(format!("{AUDIO_NAME} member missing")),
        other => other.into(),
    })?;

    let audio_path = workdir.join(AUDIO_NAME);
    std::fs::write(&audio_path, &audio).map_err(|e| {
        BundleError::Format(format!("cannot write {}: {e}", audio_path.display()))
    })?;

    Ok((metadata, audio_path))
}

enum MemberError {
    Missing,
    Auth,
    Corrupt(String),
}

impl From<MemberError> for BundleError {
    fn from(e: MemberError) -> Self {
        match e {
            MemberError::Missing => BundleError::Format("archive member missing".into()),
            MemberError::Auth => BundleError::Auth,
            MemberError::Corrupt(m) => BundleError::Format(m),
        }
    }
}

/// Decrypt and fully read one archive member. Reading to the end is what
/// drives the entry's authentication check, so a tampered payload fails here
/// instead of propagating corrupt bytes.
fn read_member(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
    password: &str,
) -> Result<Vec<u8>, MemberError> {
    let mut entry = match archive.by_name_decrypt(name, password.as_bytes()) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(MemberError::Missing),
        Err(ZipError::InvalidPassword) => return Err(MemberError::Auth),
        Err(e) => return Err(MemberError::Corrupt(format!("cannot open {name}: {e}"))),
    };
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .map_err(|e| MemberError::Corrupt(format!("cannot read {name}: {e}")))?;
    Ok(buf)
}
