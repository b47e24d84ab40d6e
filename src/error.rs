use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy for the cache engine.
///
/// Evaluation-path failures (rule evaluation, store reads) are logged and
/// degraded to "serve uncached" by their call sites; administrative failures
/// (purge, preload) are surfaced to the operator through these variants.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache root `{path}` is not writable: {reason}")]
    StorageUnwritable { path: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid `{category}` pattern `{pattern}`: {reason}")]
    ConfigInvalid {
        category: &'static str,
        pattern: String,
        reason: String,
    },
    #[error("failed to resolve content unit {unit_id}: {reason}")]
    PurgeResolutionFailed { unit_id: u64, reason: String },
    #[error("preload fetch for `{url}` failed: {reason}")]
    PreloadFetchFailed { url: String, reason: String },
    #[error("preload job {job_id} superseded by a newer run")]
    PreloadJobSuperseded { job_id: Uuid },
    #[error("url enumeration failed: {0}")]
    UrlEnumeration(String),
}

impl CacheError {
    pub fn storage_unwritable(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StorageUnwritable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config_invalid(
        category: &'static str,
        pattern: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConfigInvalid {
            category,
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn resolution_failed(unit_id: u64, reason: impl Into<String>) -> Self {
        Self::PurgeResolutionFailed {
            unit_id,
            reason: reason.into(),
        }
    }

    pub fn fetch_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreloadFetchFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
