//! Artifact downloader: builds a candidate queue per artifact, walks it until
//! one candidate succeeds, and records the result in the cache.
//!
//! Candidates come from up to four specs (`source`, `source-mirror`,
//! `binary`, `binary-mirror`) ordered by the artifact's [`FetchPreference`].
//! Transient failures move on to the next candidate; configuration errors stop
//! the artifact immediately.
//!
//! With `parallel > 1` artifacts are driven concurrently on the current task,
//! at most `parallel` at a time. Nothing is spawned, so an interrupt that drops
//! the run future also drops every in-flight transfer and kills child
//! processes.

use crate::archive;
use crate::artifact::Artifact;
use crate::cache::{ArtifactCache, CacheEntry, LockType};
use crate::config::DownloadSpec;
use crate::error::{KilnError, Result};
use crate::logging;
use crate::options::{DownloaderOptions, FetchPreference, SourceOverride};
use crate::paths::{CACHE_FILE, Layout};
use crate::report::Reporter;
use crate::result::DownloadResult;
use crate::strategy::{CustomFetch, FetchContext, Fetcher, Strategy};
use crate::transfer::HttpClient;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::path::Component;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Which config spec a queue candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Source,
    SourceMirror,
    Binary,
    BinaryMirror,
}

impl Slot {
    pub fn lock_type(self) -> LockType {
        match self {
            Self::Source | Self::SourceMirror => LockType::Source,
            Self::Binary | Self::BinaryMirror => LockType::Binary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::SourceMirror => "source-mirror",
            Self::Binary => "binary",
            Self::BinaryMirror => "binary-mirror",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub slot: Slot,
    pub strategy: Strategy,
}

impl QueueItem {
    /// e.g. `source-mirror (git)`
    pub fn label(&self) -> String {
        format!("{} ({})", self.slot, self.strategy.kind())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStatus {
    /// A usable cache entry already satisfied the preference.
    Skipped,
    Downloaded(CacheEntry),
}

/// Outcome of a whole [`ArtifactDownloader::download`] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: Vec<String>,
    pub skipped: Vec<String>,
}

impl DownloadSummary {
    fn record(&mut self, name: &str, status: &DownloadStatus) {
        match status {
            DownloadStatus::Skipped => self.skipped.push(name.to_string()),
            DownloadStatus::Downloaded(_) => self.downloaded.push(name.to_string()),
        }
    }
}

pub struct ArtifactDownloader {
    layout: Arc<Layout>,
    cache: Arc<ArtifactCache>,
    options: DownloaderOptions,
    platform: String,
    reporter: Reporter,
    context: FetchContext,
    artifacts: Vec<Artifact>,
}

impl ArtifactDownloader {
    pub fn new(
        layout: Arc<Layout>,
        cache: Arc<ArtifactCache>,
        platform: &str,
        options: DownloaderOptions,
        reporter: Reporter,
    ) -> Result<Self> {
        let http = HttpClient::new(reporter)?;
        let mut context = FetchContext::new("", layout.clone(), http, platform);
        context.retry = options.retry;
        context.shallow_clone = options.shallow_clone;

        Ok(Self {
            layout,
            cache,
            options,
            platform: platform.to_string(),
            reporter,
            context,
            artifacts: Vec::new(),
        })
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn options(&self) -> &DownloaderOptions {
        &self.options
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Register an artifact; adding the same name again replaces it.
    pub fn add(&mut self, artifact: Artifact) {
        match self.artifacts.iter_mut().find(|a| a.name() == artifact.name()) {
            Some(existing) => *existing = artifact,
            None => self.artifacts.push(artifact),
        }
    }

    pub fn add_all(&mut self, artifacts: impl IntoIterator<Item = Artifact>) {
        for artifact in artifacts {
            self.add(artifact);
        }
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Ordered fetch candidates for `artifact`, or an empty queue when the
    /// cache already satisfies its preference.
    pub fn generate_queue(&self, artifact: &Artifact) -> Result<Vec<QueueItem>> {
        let name = artifact.name();
        let preference = self.options.preference_for(name);

        let source = if preference.allows_source() {
            self.source_candidates(artifact)?
        } else {
            Vec::new()
        };
        let binary = if preference.allows_binary() {
            self.binary_candidates(artifact)?
        } else {
            Vec::new()
        };

        let queue: Vec<QueueItem> = match preference {
            FetchPreference::SourceOnly if source.is_empty() => {
                return Err(KilnError::validation(
                    name,
                    "source-only requested but no source is declared and no custom source callback is registered",
                ));
            }
            FetchPreference::BinaryOnly if binary.is_empty() => {
                return Err(KilnError::validation(
                    name,
                    format!(
                        "binary-only requested but no binary is declared for platform {}",
                        self.platform
                    ),
                ));
            }
            FetchPreference::PreferBinary | FetchPreference::BinaryOnly => {
                binary.into_iter().chain(source).collect()
            }
            FetchPreference::PreferSource | FetchPreference::SourceOnly => {
                source.into_iter().chain(binary).collect()
            }
        };

        if queue.is_empty() {
            return Err(KilnError::validation(
                name,
                format!(
                    "nothing to download: no source and no binary for platform {}",
                    self.platform
                ),
            ));
        }

        if self.options.cache_bypass.applies_to(name) {
            debug!("{}: cache bypassed", name);
            return Ok(queue);
        }

        let cached = match preference {
            FetchPreference::SourceOnly => self.cache.is_source_downloaded(name, true)?,
            FetchPreference::BinaryOnly => {
                self.cache.is_binary_downloaded(name, &self.platform, true)?
            }
            FetchPreference::PreferSource | FetchPreference::PreferBinary => {
                self.cache.is_source_downloaded(name, true)?
                    || self.cache.is_binary_downloaded(name, &self.platform, true)?
            }
        };
        if cached {
            debug!("{}: already cached ({})", name, preference);
            return Ok(Vec::new());
        }
        Ok(queue)
    }

    fn source_candidates(&self, artifact: &Artifact) -> Result<Vec<QueueItem>> {
        let name = artifact.name();
        let config = artifact.config();
        let mut candidates = Vec::new();

        let primary = match self.options.overrides.get(name) {
            Some(source) => {
                let spec = override_spec(source, config.source.as_ref());
                info!("{}: using custom source {}", name, spec.type_name());
                Some(Strategy::from_spec(name, &spec, None)?)
            }
            None => match artifact.custom_source() {
                Some(callback) => Some(Strategy::Custom(callback.clone())),
                None => declared(name, config.source.as_ref(), None)?,
            },
        };
        if let Some(strategy) = primary {
            candidates.push(QueueItem {
                slot: Slot::Source,
                strategy,
            });
        }

        if self.options.use_mirrors {
            let mirror = declared(name, config.source_mirror.as_ref(), artifact.custom_source())?;
            if let Some(strategy) = mirror {
                candidates.push(QueueItem {
                    slot: Slot::SourceMirror,
                    strategy,
                });
            }
        }
        Ok(candidates)
    }

    fn binary_candidates(&self, artifact: &Artifact) -> Result<Vec<QueueItem>> {
        let name = artifact.name();
        let config = artifact.config();
        let callback = artifact.custom_binary(&self.platform);
        let mut candidates = Vec::new();

        let primary = match callback {
            Some(callback) => Some(Strategy::Custom(callback.clone())),
            None => declared(name, config.binary.get(&self.platform), None)?,
        };
        if let Some(strategy) = primary {
            candidates.push(QueueItem {
                slot: Slot::Binary,
                strategy,
            });
        }

        if self.options.use_mirrors {
            let mirror = declared(name, config.binary_mirror.get(&self.platform), callback)?;
            if let Some(strategy) = mirror {
                candidates.push(QueueItem {
                    slot: Slot::BinaryMirror,
                    strategy,
                });
            }
        }
        Ok(candidates)
    }

    /// Fetch one artifact, trying candidates in order until one succeeds.
    pub async fn download_with_type(&self, artifact: &Artifact) -> Result<DownloadStatus> {
        let name = artifact.name();
        let queue = self.generate_queue(artifact)?;
        if queue.is_empty() {
            self.reporter.skipped(name);
            return Ok(DownloadStatus::Skipped);
        }

        let ctx = self.context.for_artifact(name);
        let mut attempts = Vec::new();
        for item in &queue {
            let label = item.label();
            debug!("{}: trying {}", name, label);

            match self.try_candidate(&ctx, item).await {
                Ok(result) => {
                    let entry = self
                        .cache
                        .lock(name, item.slot.lock_type(), &result, &self.platform)?;
                    self.reporter.downloaded(name, &entry);
                    return Ok(DownloadStatus::Downloaded(entry));
                }
                Err(e) if e.is_recoverable() => {
                    warn!("{}: {} failed: {}", name, label, e);
                    self.reporter.candidate_failed(name, &label, &e.to_string());
                    attempts.push(format!("{} [{}]", label, e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(KilnError::DownloadFailed {
            artifact: name.to_string(),
            attempts,
        })
    }

    async fn try_candidate(&self, ctx: &FetchContext, item: &QueueItem) -> Result<DownloadResult> {
        let resolved = item.strategy.resolve(ctx).await?;
        debug!(
            "{}: {} resolved to {}{}",
            ctx.artifact,
            item.slot,
            resolved.location,
            resolved
                .version
                .as_deref()
                .map(|v| format!(" ({})", v))
                .unwrap_or_default()
        );

        let spinner = self
            .reporter
            .spinner(format!("Fetching {} from {}", ctx.artifact, item.label()));
        let fetched = item.strategy.fetch(ctx, &resolved).await;
        spinner.finish_and_clear();
        let result = fetched?;

        if !result.verified {
            if let Err(e) = item.strategy.validate(ctx, &resolved, &result) {
                // A file that failed its checksum must not be picked up later
                if let Some(filename) = result.filename() {
                    let path = ctx.download_path(filename);
                    if let Err(remove_err) = fs::remove_file(&path) {
                        warn!(
                            "{}: failed to remove unverified {}: {}",
                            ctx.artifact,
                            path.display(),
                            remove_err
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(result)
    }

    /// [`download_with_type`](Self::download_with_type), then shield the
    /// locked download from cancellation cleanup.
    async fn download_recorded(
        &self,
        artifact: &Artifact,
        snapshot: &DownloadSnapshot,
    ) -> Result<DownloadStatus> {
        let status = self.download_with_type(artifact).await?;
        if let DownloadStatus::Downloaded(entry) = &status {
            snapshot.keep(&self.cache.full_path(entry));
        }
        Ok(status)
    }

    /// Download every registered artifact. Ctrl-C cancels the run and removes
    /// whatever it left in the download directory.
    pub async fn download(&self) -> Result<DownloadSummary> {
        self.download_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for interrupts: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`download`](Self::download), cancelled when `cancel` completes.
    pub async fn download_until<F>(&self, cancel: F) -> Result<DownloadSummary>
    where
        F: Future<Output = ()>,
    {
        let snapshot = DownloadSnapshot::take(&self.layout.download_dir)?;
        tokio::select! {
            result = self.run(&snapshot) => result,
            _ = cancel => {
                let removed = snapshot.cleanup()?;
                warn!("Download interrupted, removed {} partial download(s)", removed);
                Err(KilnError::Cancelled)
            }
        }
    }

    async fn run(&self, snapshot: &DownloadSnapshot) -> Result<DownloadSummary> {
        let mut summary = DownloadSummary::default();

        if self.options.parallel <= 1 || self.artifacts.len() <= 1 {
            for artifact in &self.artifacts {
                match self.download_recorded(artifact, snapshot).await {
                    Ok(status) => summary.record(artifact.name(), &status),
                    Err(e) => {
                        self.reporter.failed(artifact.name(), &e.to_string());
                        return Err(e);
                    }
                }
            }
            return Ok(summary);
        }

        info!(
            "Downloading {} artifacts, {} at a time",
            self.artifacts.len(),
            self.options.parallel
        );
        let _quiet = logging::mute_verbose();
        let results: Vec<(&str, Result<DownloadStatus>)> = stream::iter(&self.artifacts)
            .map(|artifact| async move {
                (artifact.name(), self.download_recorded(artifact, snapshot).await)
            })
            .buffer_unordered(self.options.parallel)
            .collect()
            .await;

        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(status) => summary.record(name, &status),
                Err(e) => {
                    self.reporter.failed(name, &e.to_string());
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }
        if !failures.is_empty() {
            return Err(KilnError::Batch(failures));
        }
        Ok(summary)
    }
}

/// Strategy for a declared spec; `custom` specs without a callback count as absent.
fn declared(name: &str, spec: Option<&DownloadSpec>, callback: Option<&CustomFetch>) -> Result<Option<Strategy>> {
    match spec {
        None => Ok(None),
        Some(spec) if spec.is_custom() && callback.is_none() => Ok(None),
        Some(spec) => Strategy::from_spec(name, spec, callback).map(Some),
    }
}

/// Spec standing in for the configured source. Keeps the configured
/// `extract` so the override lands where the real source would.
fn override_spec(source: &SourceOverride, configured: Option<&DownloadSpec>) -> DownloadSpec {
    let extract = configured.and_then(|spec| spec.extract()).cloned();
    match source {
        SourceOverride::Url(url) => DownloadSpec::Url {
            url: url.clone(),
            filename: None,
            version: None,
            sha256: None,
            extract,
        },
        SourceOverride::Git { branch, url } => DownloadSpec::Git {
            url: url.clone(),
            rev: branch.clone(),
            submodules: Vec::new(),
            extract,
        },
        SourceOverride::Local(path) => DownloadSpec::Local {
            dirname: path.display().to_string(),
            extract,
        },
    }
}

/// Top-level entries of the download directory before a run, plus the ones
/// completed downloads were recorded under since.
#[derive(Debug)]
pub struct DownloadSnapshot {
    dir: PathBuf,
    existing: Mutex<HashSet<OsString>>,
}

impl DownloadSnapshot {
    pub fn take(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            existing: Mutex::new(top_level_entries(dir)?.into_iter().collect()),
        })
    }

    /// Protect the top-level entry holding `path` from [`cleanup`](Self::cleanup).
    /// Paths outside the snapshot dir are ignored.
    pub fn keep(&self, path: &Path) {
        let Ok(rel) = path.strip_prefix(&self.dir) else {
            return;
        };
        if let Some(Component::Normal(name)) = rel.components().next() {
            self.existing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_os_string());
        }
    }

    /// Delete every entry that appeared since the snapshot, except the cache
    /// file. Returns how many were removed.
    pub fn cleanup(&self) -> Result<usize> {
        let existing = self.existing.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for name in top_level_entries(&self.dir)? {
            if existing.contains(&name) || name == CACHE_FILE {
                continue;
            }
            let path = self.dir.join(&name);
            debug!("Removing partial download {}", path.display());
            archive::remove_path(&path)?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn top_level_entries(dir: &Path) -> Result<Vec<OsString>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| KilnError::Other(e.into()))?;
        names.push(entry.file_name().to_os_string());
    }
    Ok(names)
}
