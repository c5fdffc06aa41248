use std::path::PathBuf;

/// Errors produced by the `vos-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The config file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`crate::VosConfig`].
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A config field failed validation.
    #[error("invalid config field '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },
}
