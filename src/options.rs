//! Operator-facing download knobs.

use crate::error::{KilnError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Source-vs-binary ordering for one artifact's fetch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchPreference {
    #[default]
    PreferSource,
    PreferBinary,
    SourceOnly,
    BinaryOnly,
}

impl FetchPreference {
    pub fn allows_source(self) -> bool {
        self != Self::BinaryOnly
    }

    pub fn allows_binary(self) -> bool {
        self != Self::SourceOnly
    }

    pub fn binary_first(self) -> bool {
        matches!(self, Self::PreferBinary | Self::BinaryOnly)
    }
}

impl std::fmt::Display for FetchPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PreferSource => "prefer-source",
            Self::PreferBinary => "prefer-binary",
            Self::SourceOnly => "source-only",
            Self::BinaryOnly => "binary-only",
        };
        write!(f, "{}", s)
    }
}

/// Which artifacts bypass the cache check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheBypass {
    #[default]
    None,
    All,
    Only(BTreeSet<String>),
}

impl CacheBypass {
    pub fn applies_to(&self, name: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }

    /// Add one artifact to the bypass set; a global bypass stays global.
    pub fn insert(&mut self, name: &str) {
        match self {
            Self::All => {}
            Self::None => *self = Self::Only(BTreeSet::from([name.to_string()])),
            Self::Only(names) => {
                names.insert(name.to_string());
            }
        }
    }
}

/// A per-artifact replacement for the configured source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOverride {
    Url(String),
    Git { branch: String, url: String },
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloaderOptions {
    /// Maximum artifacts fetched concurrently; 1 means sequential.
    pub parallel: usize,
    /// Attempts each strategy makes against the same endpoint after the first.
    pub retry: u32,
    pub default_preference: FetchPreference,
    pub preferences: BTreeMap<String, FetchPreference>,
    pub cache_bypass: CacheBypass,
    /// Try `source-mirror` / `binary-mirror` specs after the primary ones.
    pub use_mirrors: bool,
    pub shallow_clone: bool,
    pub overrides: BTreeMap<String, SourceOverride>,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            parallel: 1,
            retry: 0,
            default_preference: FetchPreference::PreferSource,
            preferences: BTreeMap::new(),
            cache_bypass: CacheBypass::None,
            use_mirrors: true,
            shallow_clone: true,
            overrides: BTreeMap::new(),
        }
    }
}

impl DownloaderOptions {
    pub fn preference_for(&self, name: &str) -> FetchPreference {
        self.preferences
            .get(name)
            .copied()
            .unwrap_or(self.default_preference)
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn with_preference(mut self, name: &str, preference: FetchPreference) -> Self {
        self.preferences.insert(name.to_string(), preference);
        self
    }

    /// Replace an artifact's source. Overridden artifacts always bypass the cache.
    pub fn add_override(&mut self, name: &str, source: SourceOverride) {
        self.cache_bypass.insert(name);
        self.overrides.insert(name.to_string(), source);
    }

    /// Parse `name:url` and register it.
    pub fn add_custom_url(&mut self, spec: &str) -> Result<()> {
        let (name, url) = spec
            .split_once(':')
            .filter(|(name, url)| !name.is_empty() && !url.is_empty())
            .ok_or_else(|| invalid_override(spec, "name:url"))?;
        self.add_override(name, SourceOverride::Url(url.to_string()));
        Ok(())
    }

    /// Parse `name:branch:url` (branch may be empty, meaning `main`) and register it.
    pub fn add_custom_git(&mut self, spec: &str) -> Result<()> {
        let mut parts = spec.splitn(3, ':');
        let (Some(name), Some(branch), Some(url)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid_override(spec, "name:branch:url"));
        };
        if name.is_empty() || url.is_empty() {
            return Err(invalid_override(spec, "name:branch:url"));
        }
        let branch = if branch.is_empty() { "main" } else { branch };
        self.add_override(
            name,
            SourceOverride::Git {
                branch: branch.to_string(),
                url: url.to_string(),
            },
        );
        Ok(())
    }

    /// Parse `name:path` and register it.
    pub fn add_custom_local(&mut self, spec: &str) -> Result<()> {
        let (name, path) = spec
            .split_once(':')
            .filter(|(name, path)| !name.is_empty() && !path.is_empty())
            .ok_or_else(|| invalid_override(spec, "name:path"))?;
        self.add_override(name, SourceOverride::Local(PathBuf::from(path)));
        Ok(())
    }
}

fn invalid_override(spec: &str, expected: &str) -> KilnError {
    KilnError::validation(
        spec,
        format!("custom source override must be of the form {}", expected),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_url_splits_on_first_colon() {
        let mut opts = DownloaderOptions::default();
        opts.add_custom_url("zlib:https://example.com/zlib.tar.gz").unwrap();
        assert_eq!(
            opts.overrides["zlib"],
            SourceOverride::Url("https://example.com/zlib.tar.gz".into())
        );
        assert!(opts.cache_bypass.applies_to("zlib"));
        assert!(!opts.cache_bypass.applies_to("curl"));
    }

    #[test]
    fn test_custom_git_default_branch() {
        let mut opts = DownloaderOptions::default();
        opts.add_custom_git("curl::https://github.com/curl/curl.git").unwrap();
        assert_eq!(
            opts.overrides["curl"],
            SourceOverride::Git {
                branch: "main".into(),
                url: "https://github.com/curl/curl.git".into(),
            }
        );
    }

    #[test]
    fn test_invalid_overrides() {
        let mut opts = DownloaderOptions::default();
        assert!(opts.add_custom_url("zlib").is_err());
        assert!(opts.add_custom_git("curl:main").is_err());
        assert!(opts.add_custom_local(":/tmp/src").is_err());
    }

    #[test]
    fn test_preference_lookup() {
        let opts = DownloaderOptions::default().with_preference("zlib", FetchPreference::BinaryOnly);
        assert_eq!(opts.preference_for("zlib"), FetchPreference::BinaryOnly);
        assert_eq!(opts.preference_for("curl"), FetchPreference::PreferSource);
    }

    #[test]
    fn test_global_bypass_stays_global() {
        let mut bypass = CacheBypass::All;
        bypass.insert("zlib");
        assert_eq!(bypass, CacheBypass::All);
    }
}
