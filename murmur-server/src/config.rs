//! Server configuration, loaded from environment variables at startup.

/// Whisper models a submission may name. Unknown models are rejected with
/// HTTP 400 rather than passed through to the transcriber.
pub const MODEL_ALLOW_LIST: &[&str] = &[
    "tiny",
    "tiny.en",
    "base",
    "base.en",
    "small",
    "small.en",
    "medium",
    "medium.en",
    "large",
    "large-v1",
    "large-v2",
    "large-v3",
    "large-v3-turbo",
    "turbo",
];

/// Runtime configuration for murmur-server.
///
/// Every field has a default so the server works out-of-the-box without any
/// environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host (default `"0.0.0.0"`).
    pub host: String,

    /// Listen port (default `8000`).
    pub port: u16,

    /// Root for inbound bundles (default `"uploads"`).
    pub upload_dir: String,

    /// Root for completed subtitle artifacts (default `"results"`).
    pub result_dir: String,

    /// Root for per-task scratch directories (default `"temp"`).
    pub temp_dir: String,

    /// Maximum admitted-but-not-terminal tasks (default `5`).
    pub pool_capacity: usize,

    /// Model used when a submission names none (default `"large-v3-turbo"`).
    pub default_model: String,

    /// Whisper CLI executable (default `"whisper"`, resolved via PATH).
    pub whisper_bin: String,

    /// How long completed results stay downloadable (default `24` hours).
    pub retention_hours: i64,

    /// Upper bound on an uploaded bundle, in MiB (default `512`).
    pub max_upload_mb: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Serve Swagger UI at `/swagger-ui` (default `true`; disable in
    /// production with `MURMUR_ENABLE_SWAGGER=false`).
    pub enable_swagger: bool,

    /// Comma-separated CORS origin allow-list; unset means wildcard.
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: env_or("MURMUR_HOST", "0.0.0.0"),
            port: parse_env("MURMUR_PORT", 8000),
            upload_dir: env_or("MURMUR_UPLOAD_DIR", "uploads"),
            result_dir: env_or("MURMUR_RESULT_DIR", "results"),
            temp_dir: env_or("MURMUR_TEMP_DIR", "temp"),
            pool_capacity: parse_env("MURMUR_POOL_CAPACITY", 5),
            default_model: env_or("MURMUR_MODEL", "large-v3-turbo"),
            whisper_bin: env_or("MURMUR_WHISPER_BIN", "whisper"),
            retention_hours: parse_env("MURMUR_RETENTION_HOURS", 24),
            max_upload_mb: parse_env("MURMUR_MAX_UPLOAD_MB", 512),
            log_level: env_or("MURMUR_LOG", "info"),
            log_json: env_flag("MURMUR_LOG_JSON", false),
            enable_swagger: env_flag("MURMUR_ENABLE_SWAGGER", true),
            cors_allowed_origins: std::env::var("MURMUR_CORS_ORIGINS").ok(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.max(1))
    }

    pub fn model_allowed(&self, model: &str) -> bool {
        MODEL_ALLOW_LIST.contains(&model)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_model_is_allow_listed() {
        let cfg = Config::from_env();
        assert!(cfg.model_allowed(&cfg.default_model));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let cfg = Config::from_env();
        assert!(!cfg.model_allowed("gpt-5"));
        assert!(!cfg.model_allowed(""));
    }
}
