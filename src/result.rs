//! Normalized outcome of a successful fetch.

use crate::config::ExtractSpec;
use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// How a fetched artifact is stored in the download directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// An archive to unpack.
    Archive,
    /// A single file to copy as-is.
    File,
    /// A git checkout directory.
    Git,
    /// A directory on the local machine, outside the download dir.
    Local,
}

impl CacheType {
    /// Whether the entry points at a file (`filename`) rather than a directory.
    pub fn is_file_based(self) -> bool {
        matches!(self, Self::Archive | Self::File)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::File => "file",
            Self::Git => "git",
            Self::Local => "local",
        }
    }
}

const ARCHIVE_SUFFIXES: &[&str] = &[
    ".zip", ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".rar", ".7z",
];

/// Whether `filename` looks like an archive rather than a plain file.
pub fn is_archive_name(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    ARCHIVE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Value returned by every fetch strategy.
///
/// Exactly one of `filename` / `dirname` is populated, matching `cache_type`.
/// File-based results are relative to the download directory; git results are
/// too, while local results carry an absolute directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    cache_type: CacheType,
    location: String,
    pub extract: Option<ExtractSpec>,
    pub version: Option<String>,
    pub verified: bool,
    pub config: Value,
}

impl DownloadResult {
    /// Result for a downloaded file; classified as archive or plain file by
    /// its extension. The file must already exist in `download_dir`.
    pub fn archive(download_dir: &Path, filename: impl Into<String>, config: Value) -> Result<Self> {
        let filename = filename.into();
        let cache_type = if is_archive_name(&filename) {
            CacheType::Archive
        } else {
            CacheType::File
        };
        Self::file_based(download_dir, cache_type, filename, config)
    }

    /// Result for a downloaded file that must never be unpacked.
    pub fn file(download_dir: &Path, filename: impl Into<String>, config: Value) -> Result<Self> {
        Self::file_based(download_dir, CacheType::File, filename.into(), config)
    }

    fn file_based(
        download_dir: &Path,
        cache_type: CacheType,
        filename: String,
        config: Value,
    ) -> Result<Self> {
        let path = download_dir.join(&filename);
        if !path.is_file() {
            return Err(KilnError::Fetch(format!(
                "downloaded file {} does not exist",
                path.display()
            )));
        }
        Ok(Self::new(cache_type, filename, config))
    }

    /// Result for a git checkout at `download_dir/dirname`.
    pub fn git(download_dir: &Path, dirname: impl Into<String>, config: Value) -> Result<Self> {
        let dirname = dirname.into();
        let path = download_dir.join(&dirname);
        if !path.is_dir() {
            return Err(KilnError::Fetch(format!(
                "cloned directory {} does not exist",
                path.display()
            )));
        }
        Ok(Self::new(CacheType::Git, dirname, config))
    }

    /// Result for a local directory used in place.
    pub fn local(dirname: &Path, config: Value) -> Result<Self> {
        if !dirname.is_dir() {
            return Err(KilnError::Fetch(format!(
                "local directory {} does not exist",
                dirname.display()
            )));
        }
        Ok(Self::new(
            CacheType::Local,
            dirname.display().to_string(),
            config,
        ))
    }

    fn new(cache_type: CacheType, location: String, config: Value) -> Self {
        Self {
            cache_type,
            location,
            extract: None,
            version: None,
            verified: false,
            config,
        }
    }

    pub fn with_extract(mut self, extract: Option<ExtractSpec>) -> Self {
        self.extract = extract;
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn verified(mut self, verified: bool) -> Self {
        self.verified = verified;
        self
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn filename(&self) -> Option<&str> {
        self.cache_type
            .is_file_based()
            .then_some(self.location.as_str())
    }

    pub fn dirname(&self) -> Option<&str> {
        (!self.cache_type.is_file_based()).then_some(self.location.as_str())
    }
}
