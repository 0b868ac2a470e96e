//! Artifact extractor: installs cached downloads into their targets.
//!
//! Three placement modes, picked by [`Artifact::source_target`] and
//! [`Artifact::binary_target`]:
//! - standard: the download becomes one directory (or one file), gated by a
//!   `.kiln-hash` marker holding the hash that produced it
//! - selective: the download is unpacked to a scratch dir and listed paths or
//!   globs are copied out; no marker, copies simply overwrite
//! - hosted: unpacked straight into a shared root, gated by a per-artifact
//!   `.kiln-{name}-installed` marker in that root
//!
//! After-extract hooks run after every install and before the marker is
//! written, so a failed hook leaves the artifact looking un-extracted.

use crate::archive;
use crate::artifact::{Artifact, ExtractHook, ExtractRequest, ExtractTarget, HookContext};
use crate::cache::{ArtifactCache, CacheEntry};
use crate::checksum;
use crate::error::{KilnError, Result};
use crate::options::FetchPreference;
use crate::paths::Layout;
use crate::report::Reporter;
use crate::result::CacheType;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marker written inside a standard-mode target.
pub const MARKER_FILE: &str = ".kiln-hash";

/// Marker written into a hosted root for one artifact.
pub fn hosted_marker(name: &str) -> String {
    format!(".kiln-{}-installed", name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStatus {
    Extracted,
    /// Marker matched the cached hash, or the artifact was already handled
    /// by this extractor.
    AlreadyExtracted,
}

pub struct ArtifactExtractor {
    layout: Arc<Layout>,
    cache: Arc<ArtifactCache>,
    platform: String,
    preference: FetchPreference,
    preferences: BTreeMap<String, FetchPreference>,
    reporter: Reporter,
    extracted: HashSet<String>,
}

impl ArtifactExtractor {
    /// Binaries are preferred whenever one is cached for `platform`.
    pub fn new(layout: Arc<Layout>, cache: Arc<ArtifactCache>, platform: &str, reporter: Reporter) -> Self {
        Self {
            layout,
            cache,
            platform: platform.to_string(),
            preference: FetchPreference::PreferBinary,
            preferences: BTreeMap::new(),
            reporter,
            extracted: HashSet::new(),
        }
    }

    /// Preference for artifacts without their own entry.
    pub fn with_preference(mut self, preference: FetchPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_artifact_preference(mut self, name: &str, preference: FetchPreference) -> Self {
        self.preferences.insert(name.to_string(), preference);
        self
    }

    /// Take over the per-artifact preferences a download ran with.
    pub fn with_preferences(mut self, preferences: &BTreeMap<String, FetchPreference>) -> Self {
        self.preferences
            .extend(preferences.iter().map(|(name, p)| (name.clone(), *p)));
        self
    }

    pub fn preference_for(&self, name: &str) -> FetchPreference {
        self.preferences
            .get(name)
            .copied()
            .unwrap_or(self.preference)
    }

    /// Extract several artifacts, `php-src` first since extensions unpack
    /// into its tree.
    pub fn extract_all<'a>(
        &mut self,
        artifacts: impl IntoIterator<Item = &'a Artifact>,
        force_source: bool,
    ) -> Result<Vec<(String, ExtractStatus)>> {
        let mut ordered: Vec<&Artifact> = artifacts.into_iter().collect();
        ordered.sort_by_key(|a| a.name() != "php-src");

        let mut statuses = Vec::with_capacity(ordered.len());
        for artifact in ordered {
            let status = self.extract(artifact, force_source)?;
            statuses.push((artifact.name().to_string(), status));
        }
        Ok(statuses)
    }

    /// Install `artifact` from the cache. Binary is used when
    /// [`Artifact::should_use_binary`] says so and `force_source` is off.
    pub fn extract(&mut self, artifact: &Artifact, force_source: bool) -> Result<ExtractStatus> {
        let name = artifact.name();
        if self.extracted.contains(name) {
            debug!("{} already extracted in this session", name);
            return Ok(ExtractStatus::AlreadyExtracted);
        }

        let preference = self.preference_for(name);
        let use_binary =
            !force_source && artifact.should_use_binary(&self.cache, &self.platform, preference)?;
        debug!("{}: {} (binary: {})", name, preference, use_binary);
        let status = if use_binary {
            self.extract_binary(artifact)?
        } else {
            self.extract_source(artifact)?
        };

        self.extracted.insert(name.to_string());
        Ok(status)
    }

    fn extract_source(&self, artifact: &Artifact) -> Result<ExtractStatus> {
        let name = artifact.name();
        let entry = self.cache.source_info(name)?.ok_or_else(|| {
            KilnError::validation(name, "source has not been downloaded, run the download first")
        })?;
        let download_path = self.cache.full_path(&entry);
        let hook_path = artifact.source_dir(&self.layout);

        if let Some(callback) = artifact.source_extract_callback() {
            ensure_present(name, "source", &entry, &download_path)?;
            info!("Extracting source of {} with custom callback", name);
            callback(&ExtractRequest {
                artifact: name,
                entry: &entry,
                download_path: &download_path,
                layout: &self.layout,
                platform: None,
            })?;
            run_hooks(artifact.source_hooks(), name, &hook_path, None)?;
            self.reporter.extracted(name, &hook_path.display().to_string());
            return Ok(ExtractStatus::Extracted);
        }

        let target = artifact.source_target(&self.layout, Some(&entry));
        let install = Install {
            name,
            what: "source",
            entry: &entry,
            download_path: &download_path,
            platform: None,
        };
        self.install(&install, &target, &hook_path, artifact.source_hooks())
    }

    fn extract_binary(&self, artifact: &Artifact) -> Result<ExtractStatus> {
        let name = artifact.name();
        let platform = self.platform.as_str();
        let entry = self.cache.binary_info(name, platform)?.ok_or_else(|| {
            KilnError::validation(
                name,
                format!("binary for {} has not been downloaded, run the download first", platform),
            )
        })?;
        let download_path = self.cache.full_path(&entry);
        let target = artifact.binary_target(&self.layout, platform, Some(&entry));
        let hook_path = match &target {
            ExtractTarget::Standard(dir) | ExtractTarget::Hosted(dir) => dir.clone(),
            ExtractTarget::Selective(_) => self.layout.pkg_root.clone(),
        };

        if let Some(callback) = artifact.binary_extract_callback(platform) {
            ensure_present(name, "binary", &entry, &download_path)?;
            info!("Extracting binary of {} with custom callback", name);
            callback(&ExtractRequest {
                artifact: name,
                entry: &entry,
                download_path: &download_path,
                layout: &self.layout,
                platform: Some(platform),
            })?;
            run_hooks(artifact.binary_hooks(platform), name, &hook_path, Some(platform))?;
            self.reporter.extracted(name, &hook_path.display().to_string());
            return Ok(ExtractStatus::Extracted);
        }

        let install = Install {
            name,
            what: "binary",
            entry: &entry,
            download_path: &download_path,
            platform: Some(platform),
        };
        self.install(&install, &target, &hook_path, artifact.binary_hooks(platform))
    }

    fn install<'h>(
        &self,
        install: &Install<'_>,
        target: &ExtractTarget,
        hook_path: &Path,
        hooks: impl Iterator<Item = &'h ExtractHook>,
    ) -> Result<ExtractStatus> {
        let Install {
            name,
            what,
            entry,
            download_path,
            platform,
        } = *install;
        ensure_present(name, what, entry, download_path)?;

        match target {
            ExtractTarget::Standard(dir) => {
                if entry.cache_type == CacheType::File {
                    if file_matches(dir, entry.hash.as_deref())? {
                        debug!("{} {} already at {}", name, what, dir.display());
                        return Ok(ExtractStatus::AlreadyExtracted);
                    }
                    info!("Copying {} {} to {}", name, what, dir.display());
                    copy_any(download_path, dir)?;
                    run_hooks(hooks, name, dir, platform)?;
                    self.reporter.extracted(name, &dir.display().to_string());
                    return Ok(ExtractStatus::Extracted);
                }

                let marker = dir.join(MARKER_FILE);
                if marker_matches(&marker, entry.hash.as_deref()) {
                    debug!("{} {} already extracted at {}", name, what, dir.display());
                    return Ok(ExtractStatus::AlreadyExtracted);
                }
                if dir.symlink_metadata().is_ok() {
                    info!("{} {} is stale, re-extracting", name, what);
                    archive::remove_path(dir)?;
                }

                info!("Extracting {} {} to {}", name, what, dir.display());
                unpack_entry(entry, download_path, dir)?;
                run_hooks(hooks, name, dir, platform)?;
                if let Some(hash) = &entry.hash {
                    fs::write(&marker, hash)?;
                }
                self.reporter.extracted(name, &dir.display().to_string());
                Ok(ExtractStatus::Extracted)
            }
            ExtractTarget::Hosted(root) => {
                let marker = root.join(hosted_marker(name));
                if marker_matches(&marker, entry.hash.as_deref()) {
                    debug!("{} {} already installed in {}", name, what, root.display());
                    return Ok(ExtractStatus::AlreadyExtracted);
                }

                info!("Installing {} {} into {}", name, what, root.display());
                fs::create_dir_all(root)?;
                match entry.cache_type {
                    CacheType::Archive => archive::unpack(download_path, root)?,
                    CacheType::File => {
                        let file_name = download_path.file_name().unwrap_or_default();
                        copy_any(download_path, &root.join(file_name))?;
                    }
                    CacheType::Git | CacheType::Local => archive::copy_dir(download_path, root)?,
                }
                run_hooks(hooks, name, root, platform)?;
                fs::write(&marker, entry.hash.as_deref().unwrap_or_default())?;
                self.reporter.extracted(name, &root.display().to_string());
                Ok(ExtractStatus::Extracted)
            }
            ExtractTarget::Selective(files) => {
                info!("Extracting {} {} with selective file mapping", name, what);
                self.extract_selective(name, entry, download_path, files)?;
                run_hooks(hooks, name, hook_path, platform)?;
                self.reporter.extracted(name, &hook_path.display().to_string());
                Ok(ExtractStatus::Extracted)
            }
        }
    }

    fn extract_selective(
        &self,
        name: &str,
        entry: &CacheEntry,
        download_path: &Path,
        files: &[(String, PathBuf)],
    ) -> Result<()> {
        fs::create_dir_all(&self.layout.working_dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!(".kiln-extract-{}-", name))
            .tempdir_in(&self.layout.working_dir)?;
        let unpacked = scratch.path().join("content");

        if entry.cache_type == CacheType::File {
            let file_name = download_path.file_name().unwrap_or_default();
            copy_any(download_path, &unpacked.join(file_name))?;
        } else {
            unpack_entry(entry, download_path, &unpacked)?;
        }

        for (pattern, dest) in files {
            if is_glob(pattern) {
                let full = format!(
                    "{}/{}",
                    glob::Pattern::escape(&unpacked.to_string_lossy()),
                    pattern
                );
                let paths = glob::glob(&full).map_err(|e| {
                    KilnError::validation(name, format!("invalid extract pattern '{}': {}", pattern, e))
                })?;
                let mut matched = 0;
                for path in paths {
                    let path = path.map_err(|e| KilnError::Extract(e.to_string()))?;
                    let Some(file_name) = path.file_name() else {
                        continue;
                    };
                    copy_any(&path, &dest.join(file_name))?;
                    matched += 1;
                }
                if matched == 0 {
                    warn!("No files matched '{}' in {}", pattern, name);
                }
                debug!("{}: '{}' matched {} path(s)", name, pattern, matched);
            } else {
                let src = unpacked.join(pattern);
                if src.symlink_metadata().is_err() {
                    warn!("'{}' not found in {}", pattern, name);
                    continue;
                }
                copy_any(&src, dest)?;
            }
        }

        scratch.close()?;
        Ok(())
    }

    /// Whether the source is installed; with `compare_hash`, whether it was
    /// installed from the currently cached download.
    pub fn is_source_extracted(&self, artifact: &Artifact, compare_hash: bool) -> Result<bool> {
        let entry = self.cache.source_info(artifact.name())?;
        let target = artifact.source_target(&self.layout, entry.as_ref());
        self.is_installed(artifact.name(), &target, entry.as_ref(), compare_hash)
    }

    pub fn is_binary_extracted(&self, artifact: &Artifact, platform: &str, compare_hash: bool) -> Result<bool> {
        let entry = self.cache.binary_info(artifact.name(), platform)?;
        let target = artifact.binary_target(&self.layout, platform, entry.as_ref());
        self.is_installed(artifact.name(), &target, entry.as_ref(), compare_hash)
    }

    fn is_installed(
        &self,
        name: &str,
        target: &ExtractTarget,
        entry: Option<&CacheEntry>,
        compare_hash: bool,
    ) -> Result<bool> {
        let (path, marker) = match target {
            ExtractTarget::Standard(dir) => (dir.clone(), dir.join(MARKER_FILE)),
            ExtractTarget::Hosted(root) => {
                let marker = root.join(hosted_marker(name));
                (marker.clone(), marker)
            }
            ExtractTarget::Selective(files) => {
                return Ok(files.iter().all(|(_, dest)| dest.exists()));
            }
        };
        if !path.exists() {
            return Ok(false);
        }
        if !compare_hash {
            return Ok(true);
        }
        let Some(entry) = entry else {
            return Ok(false);
        };
        match (&entry.hash, entry.cache_type) {
            // Nothing to compare against, presence is all we can know
            (None, _) => Ok(true),
            (Some(_), CacheType::File) if matches!(target, ExtractTarget::Standard(_)) => {
                file_matches(&path, entry.hash.as_deref())
            }
            (Some(hash), _) => Ok(read_marker(&marker).as_deref() == Some(hash.as_str())),
        }
    }
}

#[derive(Clone, Copy)]
struct Install<'a> {
    name: &'a str,
    what: &'static str,
    entry: &'a CacheEntry,
    download_path: &'a Path,
    platform: Option<&'a str>,
}

fn ensure_present(name: &str, what: &'static str, entry: &CacheEntry, path: &Path) -> Result<()> {
    let present = match entry.cache_type {
        CacheType::Archive | CacheType::File => path.is_file(),
        CacheType::Git | CacheType::Local => path.is_dir(),
    };
    if present {
        Ok(())
    } else {
        Err(KilnError::MissingDownload {
            artifact: name.to_string(),
            what,
            path: path.to_path_buf(),
        })
    }
}

/// Put a standard-mode download in place at `target`.
fn unpack_entry(entry: &CacheEntry, download_path: &Path, target: &Path) -> Result<()> {
    match entry.cache_type {
        CacheType::Archive => archive::unpack(download_path, target),
        CacheType::File => copy_any(download_path, target),
        CacheType::Git => archive::copy_dir(download_path, target),
        CacheType::Local => link_local(download_path, target),
    }
}

#[cfg(unix)]
fn link_local(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(source, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn link_local(source: &Path, target: &Path) -> Result<()> {
    archive::copy_dir(source, target)
}

fn copy_any(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        return archive::copy_dir(src, dst);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    debug!("Copied {} -> {}", src.display(), dst.display());
    Ok(())
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn read_marker(marker: &Path) -> Option<String> {
    fs::read_to_string(marker).ok().map(|s| s.trim().to_string())
}

/// A marker only counts when both it and the expected hash exist and agree.
fn marker_matches(marker: &Path, expected: Option<&str>) -> bool {
    match expected {
        Some(expected) => read_marker(marker).as_deref() == Some(expected),
        None => false,
    }
}

fn file_matches(path: &Path, expected: Option<&str>) -> Result<bool> {
    match expected {
        Some(expected) if path.is_file() => Ok(checksum::sha256_file(path)? == expected),
        _ => Ok(false),
    }
}

fn run_hooks<'h>(
    hooks: impl Iterator<Item = &'h ExtractHook>,
    name: &str,
    path: &Path,
    platform: Option<&str>,
) -> Result<()> {
    let ctx = HookContext {
        artifact: name,
        path,
        platform,
    };
    for hook in hooks {
        hook(&ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_requires_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join(MARKER_FILE);
        fs::write(&marker, "abc\n").unwrap();
        assert!(marker_matches(&marker, Some("abc")));
        assert!(!marker_matches(&marker, Some("def")));
        assert!(!marker_matches(&marker, None));
        assert!(!marker_matches(&dir.path().join("missing"), Some("abc")));
    }

    #[test]
    fn test_is_glob() {
        assert!(is_glob("include/*.h"));
        assert!(is_glob("lib/lib?.a"));
        assert!(!is_glob("bin/tool"));
    }

    #[test]
    fn test_hosted_marker_name() {
        assert_eq!(hosted_marker("openssl"), ".kiln-openssl-installed");
    }
}
