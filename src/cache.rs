//! Download ledger persisted at `{download_dir}/.cache.json`.
//!
//! The ledger records, per artifact, one `source` entry and one `binary` entry
//! per platform:
//!
//! ```json
//! {
//!   "zlib": {
//!     "source": { "lock_type": "source", "cache_type": "archive", "filename": "zlib-1.3.1.tar.gz", "hash": "…" },
//!     "binary": { "linux-x86_64": { "lock_type": "binary", "cache_type": "archive", "platform": "linux-x86_64", … } }
//!   }
//! }
//! ```
//!
//! The document is loaded on first use and held in memory. Every mutation
//! rewrites the whole file through a temp file and rename, so a reader never
//! sees a partially written ledger.

use crate::checksum;
use crate::config::ExtractSpec;
use crate::error::{KilnError, Result};
use crate::paths::CACHE_FILE;
use crate::result::{CacheType, DownloadResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Source,
    Binary,
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// One persisted download record. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub lock_type: LockType,
    pub cache_type: CacheType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirname: Option<String>,
    #[serde(default)]
    pub extract: Option<ExtractSpec>,
    /// sha256 for archive/file, commit id for git, always null for local.
    pub hash: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

/// Records for one artifact name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    #[serde(default)]
    pub source: Option<CacheEntry>,
    #[serde(default)]
    pub binary: BTreeMap<String, CacheEntry>,
}

impl ArtifactRecord {
    fn is_empty(&self) -> bool {
        self.source.is_none() && self.binary.is_empty()
    }
}

type Document = BTreeMap<String, ArtifactRecord>;

pub struct ArtifactCache {
    download_dir: PathBuf,
    doc: Mutex<Option<Document>>,
}

impl ArtifactCache {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            doc: Mutex::new(None),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.download_dir.join(CACHE_FILE)
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Borrow the in-memory document, loading it from disk on first use.
    fn document(&self) -> Result<MutexGuard<'_, Option<Document>>> {
        let mut guard = self.doc.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        Ok(guard)
    }

    fn load(&self) -> Result<Document> {
        let path = self.path();
        if !path.exists() {
            debug!("No cache file at {}, starting empty", path.display());
            return Ok(Document::new());
        }
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(Document::new());
        }
        serde_json::from_str(&content).map_err(|source| KilnError::CacheCorrupt { path, source })
    }

    fn save(&self, doc: &Document) -> Result<()> {
        fs::create_dir_all(&self.download_dir)?;
        let json = serde_json::to_string_pretty(doc)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.download_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(self.path()).map_err(|e| e.error)?;
        Ok(())
    }

    /// Persist `next` and only then make it the in-memory document.
    fn commit(&self, guard: &mut MutexGuard<'_, Option<Document>>, next: Document) -> Result<()> {
        self.save(&next)?;
        **guard = Some(next);
        Ok(())
    }

    pub fn is_source_downloaded(&self, name: &str, compare_hash: bool) -> Result<bool> {
        match self.source_info(name)? {
            Some(entry) => self.is_entry_present(&entry, compare_hash),
            None => Ok(false),
        }
    }

    pub fn is_binary_downloaded(&self, name: &str, platform: &str, compare_hash: bool) -> Result<bool> {
        match self.binary_info(name, platform)? {
            Some(entry) => self.is_entry_present(&entry, compare_hash),
            None => Ok(false),
        }
    }

    /// Whether the backing file/dir still exists and, with `compare_hash`,
    /// still hashes to the recorded value. Local entries carry no hash and so
    /// never pass a hash comparison.
    fn is_entry_present(&self, entry: &CacheEntry, compare_hash: bool) -> Result<bool> {
        let path = self.full_path(entry);
        match entry.cache_type {
            CacheType::Archive | CacheType::File => {
                if !path.is_file() {
                    return Ok(false);
                }
                if !compare_hash {
                    return Ok(true);
                }
                match &entry.hash {
                    Some(hash) => Ok(checksum::sha256_file(&path)? == *hash),
                    None => Ok(false),
                }
            }
            CacheType::Git => {
                if !path.join(".git").exists() {
                    return Ok(false);
                }
                if !compare_hash {
                    return Ok(true);
                }
                match (&entry.hash, checksum::git_head(&path)) {
                    (Some(hash), Ok(head)) => Ok(head == *hash),
                    _ => Ok(false),
                }
            }
            CacheType::Local => Ok(!compare_hash && path.is_dir()),
        }
    }

    /// Record a successful download, replacing any previous entry for the slot.
    /// `platform` is stored only for binary entries.
    pub fn lock(
        &self,
        name: &str,
        lock_type: LockType,
        result: &DownloadResult,
        platform: &str,
    ) -> Result<CacheEntry> {
        let mut entry = CacheEntry {
            lock_type,
            cache_type: result.cache_type(),
            filename: result.filename().map(str::to_string),
            dirname: result.dirname().map(str::to_string),
            extract: result.extract.clone(),
            hash: None,
            version: result.version.clone(),
            config: result.config.clone(),
            platform: (lock_type == LockType::Binary).then(|| platform.to_string()),
            locked_at: Some(Utc::now()),
        };
        entry.hash = self.compute_hash(&entry)?;

        let mut guard = self.document()?;
        let mut next = guard.clone().unwrap_or_default();
        let record = next.entry(name.to_string()).or_default();
        match lock_type {
            LockType::Source => record.source = Some(entry.clone()),
            LockType::Binary => {
                record.binary.insert(platform.to_string(), entry.clone());
            }
        }
        self.commit(&mut guard, next)?;

        info!(
            "Locked {} {} ({}{})",
            name,
            lock_type,
            entry.cache_type.as_str(),
            entry
                .version
                .as_deref()
                .map(|v| format!(", version {}", v))
                .unwrap_or_default()
        );
        Ok(entry)
    }

    fn compute_hash(&self, entry: &CacheEntry) -> Result<Option<String>> {
        let path = self.full_path(entry);
        match entry.cache_type {
            CacheType::Archive | CacheType::File => Ok(Some(checksum::sha256_file(&path)?)),
            CacheType::Git => Ok(Some(checksum::git_head(&path)?)),
            CacheType::Local => Ok(None),
        }
    }

    pub fn source_info(&self, name: &str) -> Result<Option<CacheEntry>> {
        let guard = self.document()?;
        Ok(guard
            .as_ref()
            .and_then(|doc| doc.get(name))
            .and_then(|record| record.source.clone()))
    }

    pub fn binary_info(&self, name: &str, platform: &str) -> Result<Option<CacheEntry>> {
        let guard = self.document()?;
        Ok(guard
            .as_ref()
            .and_then(|doc| doc.get(name))
            .and_then(|record| record.binary.get(platform).cloned()))
    }

    /// Every record, ordered by artifact name.
    pub fn entries(&self) -> Result<Vec<(String, ArtifactRecord)>> {
        let guard = self.document()?;
        Ok(guard
            .as_ref()
            .map(|doc| doc.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    /// Absolute path of the file or directory behind an entry.
    pub fn full_path(&self, entry: &CacheEntry) -> PathBuf {
        match entry.cache_type {
            CacheType::Archive | CacheType::File => self
                .download_dir
                .join(entry.filename.as_deref().unwrap_or_default()),
            CacheType::Git => self
                .download_dir
                .join(entry.dirname.as_deref().unwrap_or_default()),
            CacheType::Local => PathBuf::from(entry.dirname.as_deref().unwrap_or_default()),
        }
    }

    pub fn remove_source(&self, name: &str, delete_file: bool) -> Result<()> {
        self.remove(name, delete_file, |record| record.source.take())
    }

    pub fn remove_binary(&self, name: &str, platform: &str, delete_file: bool) -> Result<()> {
        self.remove(name, delete_file, |record| record.binary.remove(platform))
    }

    fn remove(
        &self,
        name: &str,
        delete_file: bool,
        take: impl FnOnce(&mut ArtifactRecord) -> Option<CacheEntry>,
    ) -> Result<()> {
        let mut guard = self.document()?;
        let mut next = guard.clone().unwrap_or_default();
        let Some(record) = next.get_mut(name) else {
            return Ok(());
        };
        let Some(entry) = take(record) else {
            return Ok(());
        };
        if record.is_empty() {
            next.remove(name);
        }
        self.commit(&mut guard, next)?;
        drop(guard);

        // Local entries point outside the download dir and are never deleted
        if delete_file && entry.cache_type != CacheType::Local {
            let path = self.full_path(&entry);
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else if path.exists() {
                fs::remove_file(&path)?;
            }
            info!("Removed {}", path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn archive(dir: &Path, name: &str, contents: &str) -> DownloadResult {
        fs::write(dir.join(name), contents).unwrap();
        DownloadResult::archive(dir, name, json!({"type": "url"})).unwrap()
    }

    #[test]
    fn test_missing_cache_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = ArtifactCache::new(dir.path());
        assert!(!cache.is_source_downloaded("zlib", false).unwrap());
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_cache_file_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join(CACHE_FILE), "{not json").unwrap();
        let cache = ArtifactCache::new(dir.path());
        let err = cache.is_source_downloaded("zlib", false).unwrap_err();
        assert!(matches!(err, KilnError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_lock_persists_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = archive(dir.path(), "zlib.tar.gz", "bytes");
        let cache = ArtifactCache::new(dir.path());
        let entry = cache.lock("zlib", LockType::Source, &result, "linux-x86_64").unwrap();
        assert_eq!(entry.platform, None);
        assert_eq!(entry.hash, Some(checksum::sha256_file(&dir.path().join("zlib.tar.gz")).unwrap()));

        let reloaded = ArtifactCache::new(dir.path());
        assert!(reloaded.is_source_downloaded("zlib", true).unwrap());
        assert_eq!(reloaded.source_info("zlib").unwrap(), Some(entry));
    }

    #[test]
    fn test_binary_lock_records_platform() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = archive(dir.path(), "zlib-linux.txz", "bin");
        let cache = ArtifactCache::new(dir.path());
        cache.lock("zlib", LockType::Binary, &result, "linux-x86_64").unwrap();
        let entry = cache.binary_info("zlib", "linux-x86_64").unwrap().unwrap();
        assert_eq!(entry.platform.as_deref(), Some("linux-x86_64"));
        assert!(cache.is_binary_downloaded("zlib", "linux-x86_64", true).unwrap());
        assert!(!cache.is_binary_downloaded("zlib", "macos-aarch64", false).unwrap());
    }

    #[test]
    fn test_local_entries_never_pass_hash_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = tempfile::TempDir::new().unwrap();
        let result = DownloadResult::local(local.path(), json!({"type": "local"})).unwrap();
        let cache = ArtifactCache::new(dir.path());
        let entry = cache.lock("dev", LockType::Source, &result, "linux-x86_64").unwrap();
        assert_eq!(entry.hash, None);
        assert!(cache.is_source_downloaded("dev", false).unwrap());
        assert!(!cache.is_source_downloaded("dev", true).unwrap());
    }

    #[test]
    fn test_remove_source_deletes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = archive(dir.path(), "zlib.tar.gz", "bytes");
        let cache = ArtifactCache::new(dir.path());
        cache.lock("zlib", LockType::Source, &result, "linux-x86_64").unwrap();

        cache.remove_source("zlib", true).unwrap();
        assert!(!dir.path().join("zlib.tar.gz").exists());
        assert_eq!(cache.source_info("zlib").unwrap(), None);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_save_leaves_memory_unchanged() {
        let dir = tempfile::TempDir::new().unwrap();
        let zlib = archive(dir.path(), "zlib.tar.gz", "bytes");
        let curl = archive(dir.path(), "curl.tar.xz", "more");
        let cache = ArtifactCache::new(dir.path());
        let locked = cache.lock("zlib", LockType::Source, &zlib, "linux-x86_64").unwrap();

        // A directory in place of the ledger makes the rename in save fail
        fs::remove_file(dir.path().join(CACHE_FILE)).unwrap();
        fs::create_dir(dir.path().join(CACHE_FILE)).unwrap();

        assert!(cache.lock("curl", LockType::Source, &curl, "linux-x86_64").is_err());
        assert_eq!(cache.source_info("curl").unwrap(), None);

        assert!(cache.remove_source("zlib", true).is_err());
        assert_eq!(cache.source_info("zlib").unwrap(), Some(locked));
        assert!(dir.path().join("zlib.tar.gz").exists());
    }
}
