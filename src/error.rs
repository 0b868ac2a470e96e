use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KilnError {
    /// Misconfigured artifact or a requested mode with no viable source.
    #[error("Invalid artifact '{artifact}': {message}")]
    Validation { artifact: String, message: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Command `{command}` failed: {message}")]
    Process { command: String, message: String },

    #[error("Integrity check failed for '{artifact}': expected {expected}, got {actual}")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error(
        "Downloaded {what} of '{artifact}' not found at {}. Remove the cache entry or re-run the download.",
        .path.display()
    )]
    MissingDownload {
        artifact: String,
        what: &'static str,
        path: PathBuf,
    },

    #[error("Unknown archive format: {}", .0.display())]
    UnknownArchive(PathBuf),

    #[error("Extraction failed: {0}")]
    Extract(String),

    #[error("Cache file {} is malformed: {source}", .path.display())]
    CacheCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "Download artifact '{artifact}' failed after trying {}. Please check your internet connection and try again, or use --custom-url/--custom-git/--custom-local to override.",
        .attempts.join(", ")
    )]
    DownloadFailed {
        artifact: String,
        attempts: Vec<String>,
    },

    #[error("Failed to download {} artifact(s):\n{}", .0.len(), .0.join("\n"))]
    Batch(Vec<String>),

    #[error("Download cancelled by user")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    pub fn validation(artifact: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            artifact: artifact.into(),
            message: message.into(),
        }
    }

    /// Whether the download queue may move on to its next candidate after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Fetch(_)
                | Self::Http(_)
                | Self::Process { .. }
                | Self::Integrity { .. }
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
