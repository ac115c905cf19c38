//! murmur-core – task lifecycle engine for the murmur transcription service.
//!
//! The crate holds everything both binaries share: the encrypted bundle
//! codec, the on-disk artifact store, the Whisper subprocess driver, the
//! mutex-guarded task registry with bounded admission, and the
//! single-consumer worker loop.

pub mod bundle;
pub mod registry;
pub mod store;
pub mod transcriber;
pub mod types;
pub mod worker;

#[cfg(test)]
mod tests;

pub use bundle::{BundleError, BundleMetadata};
pub use registry::{AdmitError, CancelOutcome, ClaimedTask, RegistryError, TaskRegistry};
pub use store::{ArtifactStore, StoreError};
pub use transcriber::{TranscribeError, TranscriberDriver};
pub use types::{PoolStatus, ResultDescriptor, TaskFailure, TaskSnapshot, TaskState};
pub use worker::Worker;
