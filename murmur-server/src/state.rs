//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use murmur_core::{ArtifactStore, TaskRegistry};

use crate::config::Config;

/// State shared across all HTTP handlers and the background tasks.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Authoritative task table and admission control.
    pub registry: Arc<TaskRegistry>,
    /// Filesystem owner for bundles, scratch dirs, and results.
    pub store: Arc<ArtifactStore>,
}
