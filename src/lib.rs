//! Library interface for kiln
//!
//! The engine behind the `kiln` binary: declarative artifact configs, a
//! download queue with mirrors and fallbacks, a hash-gated download cache and
//! an extractor that installs cached downloads into a build tree.

pub mod archive;
pub mod artifact;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod logging;
pub mod options;
pub mod paths;
pub mod platform;
pub mod report;
pub mod result;
pub mod strategy;
pub mod transfer;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactRegistry, ExtractTarget, HookContext};
pub use cache::{ArtifactCache, CacheEntry, LockType};
pub use config::{ArtifactConfig, DownloadSpec, ExtractSpec};
pub use download::{ArtifactDownloader, DownloadStatus, DownloadSummary};
pub use error::{KilnError, Result};
pub use extract::{ArtifactExtractor, ExtractStatus};
pub use options::{CacheBypass, DownloaderOptions, FetchPreference};
pub use paths::Layout;
pub use report::Reporter;
pub use result::{CacheType, DownloadResult};
