//! Artifact entity: static config plus code-registered extension points.
//!
//! An [`Artifact`] never touches the network or the filesystem itself. It
//! answers questions about where things go ([`Artifact::source_target`],
//! [`Artifact::binary_target`]) and which callbacks apply on a platform.

use crate::cache::{ArtifactCache, CacheEntry};
use crate::config::{ArtifactConfig, ExtractSpec};
use crate::error::{KilnError, Result};
use crate::options::FetchPreference;
use crate::paths::Layout;
use crate::strategy::CustomFetch;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a custom extract callback is asked to install.
pub struct ExtractRequest<'a> {
    pub artifact: &'a str,
    pub entry: &'a CacheEntry,
    /// Downloaded file or directory backing the entry.
    pub download_path: &'a Path,
    pub layout: &'a Layout,
    /// Set for binary extraction.
    pub platform: Option<&'a str>,
}

/// Passed to after-extract hooks.
pub struct HookContext<'a> {
    pub artifact: &'a str,
    /// Directory the artifact was installed into.
    pub path: &'a Path,
    pub platform: Option<&'a str>,
}

pub type ExtractCallback = Arc<dyn Fn(&ExtractRequest<'_>) -> Result<()> + Send + Sync>;
pub type ExtractHook = Arc<dyn Fn(&HookContext<'_>) -> Result<()> + Send + Sync>;

/// A callback limited to some platforms; an empty list means every platform.
#[derive(Clone)]
pub struct PlatformScoped<T> {
    pub platforms: Vec<String>,
    pub callback: T,
}

impl<T> PlatformScoped<T> {
    pub fn applies_to(&self, platform: &str) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| p == platform)
    }
}

/// Resolved placement of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractTarget {
    /// The whole archive becomes one directory, or one file lands in it.
    Standard(PathBuf),
    /// Listed paths or globs inside the archive are copied to their own destinations.
    Selective(Vec<(String, PathBuf)>),
    /// Unpacked straight into a root shared with other artifacts.
    Hosted(PathBuf),
}

#[derive(Clone)]
pub struct Artifact {
    name: String,
    config: ArtifactConfig,
    custom_source: Option<CustomFetch>,
    custom_binary: BTreeMap<String, CustomFetch>,
    source_extract: Option<ExtractCallback>,
    binary_extract: Option<PlatformScoped<ExtractCallback>>,
    after_source_extract: Vec<ExtractHook>,
    after_binary_extract: Vec<PlatformScoped<ExtractHook>>,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("custom_source", &self.custom_source.is_some())
            .field("custom_binary", &self.custom_binary.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Artifact {
    pub fn new(name: impl Into<String>, config: ArtifactConfig) -> Self {
        Self {
            name: name.into(),
            config,
            custom_source: None,
            custom_binary: BTreeMap::new(),
            source_extract: None,
            binary_extract: None,
            after_source_extract: Vec::new(),
            after_binary_extract: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ArtifactConfig {
        &self.config
    }

    pub fn set_custom_source(&mut self, callback: CustomFetch) {
        self.custom_source = Some(callback);
    }

    pub fn set_custom_binary(&mut self, platforms: &[&str], callback: CustomFetch) {
        for platform in platforms {
            self.custom_binary
                .insert(platform.to_string(), callback.clone());
        }
    }

    pub fn custom_source(&self) -> Option<&CustomFetch> {
        self.custom_source.as_ref()
    }

    pub fn custom_binary(&self, platform: &str) -> Option<&CustomFetch> {
        self.custom_binary.get(platform)
    }

    pub fn set_source_extract(&mut self, callback: ExtractCallback) {
        self.source_extract = Some(callback);
    }

    pub fn set_binary_extract(&mut self, platforms: &[&str], callback: ExtractCallback) {
        self.binary_extract = Some(PlatformScoped {
            platforms: platforms.iter().map(|p| p.to_string()).collect(),
            callback,
        });
    }

    pub fn source_extract_callback(&self) -> Option<&ExtractCallback> {
        self.source_extract.as_ref()
    }

    pub fn binary_extract_callback(&self, platform: &str) -> Option<&ExtractCallback> {
        self.binary_extract
            .as_ref()
            .filter(|scoped| scoped.applies_to(platform))
            .map(|scoped| &scoped.callback)
    }

    pub fn on_source_extracted(&mut self, hook: ExtractHook) {
        self.after_source_extract.push(hook);
    }

    pub fn on_binary_extracted(&mut self, platforms: &[&str], hook: ExtractHook) {
        self.after_binary_extract.push(PlatformScoped {
            platforms: platforms.iter().map(|p| p.to_string()).collect(),
            callback: hook,
        });
    }

    pub fn source_hooks(&self) -> impl Iterator<Item = &ExtractHook> {
        self.after_source_extract.iter()
    }

    /// Binary hooks for `platform`, in registration order.
    pub fn binary_hooks<'a>(&'a self, platform: &'a str) -> impl Iterator<Item = &'a ExtractHook> + 'a {
        self.after_binary_extract
            .iter()
            .filter(move |scoped| scoped.applies_to(platform))
            .map(|scoped| &scoped.callback)
    }

    /// Declared source, or a custom fetch callback, is available.
    pub fn has_source(&self) -> bool {
        self.custom_source.is_some()
            || self
                .config
                .source
                .as_ref()
                .is_some_and(|spec| !spec.is_custom())
    }

    /// Declared binary for `platform`, or a custom fetch callback for it.
    pub fn has_platform_binary(&self, platform: &str) -> bool {
        self.custom_binary.contains_key(platform)
            || self
                .config
                .binary
                .get(platform)
                .is_some_and(|spec| !spec.is_custom())
    }

    /// Platforms with a usable binary, sorted.
    pub fn binary_platforms(&self) -> Vec<String> {
        let mut platforms: BTreeSet<String> = self.custom_binary.keys().cloned().collect();
        for (platform, spec) in &self.config.binary {
            if !spec.is_custom() {
                platforms.insert(platform.clone());
            }
        }
        platforms.into_iter().collect()
    }

    /// Default directory the source tree is extracted to.
    pub fn source_dir(&self, layout: &Layout) -> PathBuf {
        let extract = self.config.source.as_ref().and_then(|s| s.extract());
        match extract {
            Some(ExtractSpec::Path(path)) => layout.resolve_under(&layout.source_dir, path, &self.name),
            _ => layout.source_dir.join(&self.name),
        }
    }

    /// Directory build tools should run in: the source dir plus `source-root`.
    pub fn source_root(&self, layout: &Layout) -> PathBuf {
        let dir = self.source_dir(layout);
        match &self.config.source_root {
            Some(root) => dir.join(root),
            None => dir,
        }
    }

    /// Placement for the source, preferring the `extract` recorded with the
    /// download over the configured one.
    pub fn source_target(&self, layout: &Layout, entry: Option<&CacheEntry>) -> ExtractTarget {
        let extract = entry
            .and_then(|e| e.extract.as_ref())
            .or_else(|| self.config.source.as_ref().and_then(|s| s.extract()));
        match extract {
            Some(ExtractSpec::Map(files)) => {
                ExtractTarget::Selective(self.selective_map(layout, &layout.source_dir, files))
            }
            Some(ExtractSpec::Path(path)) => {
                ExtractTarget::Standard(layout.resolve_under(&layout.source_dir, path, &self.name))
            }
            None => ExtractTarget::Standard(self.source_dir(layout)),
        }
    }

    /// Placement for the binary of `platform`.
    pub fn binary_target(&self, layout: &Layout, platform: &str, entry: Option<&CacheEntry>) -> ExtractTarget {
        let spec = self.config.binary.get(platform);
        if spec.is_some_and(|s| s.is_hosted()) {
            return ExtractTarget::Hosted(layout.build_root.clone());
        }

        let extract = entry
            .and_then(|e| e.extract.as_ref())
            .or_else(|| spec.and_then(|s| s.extract()));
        match extract {
            Some(ExtractSpec::Path(path)) if path == "hosted" => {
                ExtractTarget::Hosted(layout.build_root.clone())
            }
            Some(ExtractSpec::Path(path)) => {
                ExtractTarget::Standard(layout.resolve_under(&layout.pkg_root, path, &self.name))
            }
            Some(ExtractSpec::Map(files)) => {
                ExtractTarget::Selective(self.selective_map(layout, &layout.pkg_root, files))
            }
            None => ExtractTarget::Standard(layout.pkg_root.join(&self.name)),
        }
    }

    fn selective_map(
        &self,
        layout: &Layout,
        base: &Path,
        files: &BTreeMap<String, String>,
    ) -> Vec<(String, PathBuf)> {
        files
            .iter()
            .map(|(src, dst)| (src.clone(), layout.resolve_under(base, dst, &self.name)))
            .collect()
    }

    /// Whether extraction should install the binary rather than the source.
    ///
    /// The binary is used only when one is declared for `platform` and is
    /// present in the cache. Under `PreferSource` a present source still wins.
    pub fn should_use_binary(
        &self,
        cache: &ArtifactCache,
        platform: &str,
        preference: FetchPreference,
    ) -> Result<bool> {
        if !preference.allows_binary() || !self.has_platform_binary(platform) {
            return Ok(false);
        }
        if !cache.is_binary_downloaded(&self.name, platform, false)? {
            return Ok(false);
        }
        match preference {
            FetchPreference::PreferSource => Ok(!cache.is_source_downloaded(&self.name, false)?),
            _ => Ok(true),
        }
    }
}

/// All known artifacts, by name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRegistry {
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: BTreeMap<String, ArtifactConfig>) -> Self {
        Self {
            artifacts: configs
                .into_iter()
                .map(|(name, config)| (name.clone(), Artifact::new(name, config)))
                .collect(),
        }
    }

    /// Load every config file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        Ok(Self::from_configs(crate::config::load_dir(dir)?))
    }

    pub fn insert(&mut self, artifact: Artifact) {
        self.artifacts.insert(artifact.name().to_string(), artifact);
    }

    pub fn get(&self, name: &str) -> Result<&Artifact> {
        self.artifacts
            .get(name)
            .ok_or_else(|| KilnError::validation(name, "artifact is not declared in any config"))
    }

    /// Mutable access, used to register callbacks and hooks.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Artifact> {
        self.artifacts
            .get_mut(name)
            .ok_or_else(|| KilnError::validation(name, "artifact is not declared in any config"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadSpec;
    use crate::error::KilnError;
    use serde_json::json;

    fn layout() -> Layout {
        Layout::new("/work", "linux-x86_64")
    }

    fn artifact(raw: serde_json::Value) -> Artifact {
        Artifact::new("zlib", ArtifactConfig::from_value("zlib", &raw).unwrap())
    }

    #[test]
    fn test_default_source_dir() {
        let a = artifact(json!({ "source": "https://zlib.net/zlib.tar.gz" }));
        assert_eq!(a.source_dir(&layout()), PathBuf::from("/work/source/zlib"));
        assert_eq!(
            a.source_target(&layout(), None),
            ExtractTarget::Standard(PathBuf::from("/work/source/zlib"))
        );
    }

    #[test]
    fn test_source_dir_relative_and_absolute() {
        let a = artifact(json!({ "source": { "type": "url", "url": "https://x/y.tgz", "extract": "php-src/ext/{artifact_name}" } }));
        assert_eq!(a.source_dir(&layout()), PathBuf::from("/work/source/php-src/ext/zlib"));

        let a = artifact(json!({ "source": { "type": "url", "url": "https://x/y.tgz", "extract": "/opt/zlib" } }));
        assert_eq!(a.source_dir(&layout()), PathBuf::from("/opt/zlib"));
    }

    #[test]
    fn test_source_root() {
        let a = artifact(json!({ "source": "https://x/y.tgz", "metadata": { "source-root": "contrib/minizip" } }));
        assert_eq!(a.source_root(&layout()), PathBuf::from("/work/source/zlib/contrib/minizip"));
    }

    #[test]
    fn test_binary_targets() {
        let a = artifact(json!({ "binary": "hosted" }));
        assert_eq!(
            a.binary_target(&layout(), "linux-x86_64", None),
            ExtractTarget::Hosted(PathBuf::from("/work/buildroot"))
        );

        let a = artifact(json!({ "binary": { "linux-x86_64": "https://x/zlib.txz" } }));
        assert_eq!(
            a.binary_target(&layout(), "linux-x86_64", None),
            ExtractTarget::Standard(PathBuf::from("/work/pkgroot/linux-x86_64/zlib"))
        );

        let a = artifact(json!({ "binary": { "linux-x86_64": {
            "type": "url", "url": "https://x/zlib.txz",
            "extract": { "lib/libz.a": "{build_root_path}/lib/libz.a" }
        } } }));
        assert_eq!(
            a.binary_target(&layout(), "linux-x86_64", None),
            ExtractTarget::Selective(vec![(
                "lib/libz.a".to_string(),
                PathBuf::from("/work/buildroot/lib/libz.a")
            )])
        );
    }

    #[test]
    fn test_custom_binary_counts_only_with_callback() {
        let mut a = artifact(json!({ "binary": "custom" }));
        assert!(!a.has_platform_binary("linux-x86_64"));
        assert!(a.binary_platforms().is_empty());

        let callback = crate::strategy::custom_fetch(|_ctx| async {
            Err(KilnError::Fetch("unused".into()))
        });
        a.set_custom_binary(&["linux-x86_64"], callback);
        assert!(a.has_platform_binary("linux-x86_64"));
        assert_eq!(a.binary_platforms(), vec!["linux-x86_64".to_string()]);
        assert!(!a.has_source());
    }

    #[test]
    fn test_binary_hooks_filtered_by_platform() {
        let mut a = artifact(json!({}));
        a.on_binary_extracted(&["macos-aarch64"], Arc::new(|_ctx: &HookContext<'_>| -> Result<()> { Ok(()) }));
        a.on_binary_extracted(&[], Arc::new(|_ctx: &HookContext<'_>| -> Result<()> { Ok(()) }));
        assert_eq!(a.binary_hooks("linux-x86_64").count(), 1);
        assert_eq!(a.binary_hooks("macos-aarch64").count(), 2);
    }

    #[test]
    fn test_registry_unknown_artifact() {
        let mut configs = BTreeMap::new();
        configs.insert("zlib".to_string(), ArtifactConfig {
            source: Some(DownloadSpec::Custom),
            ..ArtifactConfig::default()
        });
        let mut registry = ArtifactRegistry::from_configs(configs);
        assert!(registry.get("zlib").is_ok());
        assert!(matches!(registry.get_mut("openssl"), Err(KilnError::Validation { .. })));
    }
}
