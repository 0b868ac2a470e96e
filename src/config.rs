//! Declarative artifact configuration.
//!
//! Artifacts are described in JSON files, each an object keyed by artifact name:
//!
//! ```json
//! {
//!   "zlib": {
//!     "source": { "type": "ghrel", "repo": "madler/zlib", "match": "zlib.+\\.tar\\.gz" },
//!     "source-mirror": "https://zlib.net/zlib-1.3.1.tar.gz",
//!     "binary": "hosted"
//!   }
//! }
//! ```
//!
//! Shorthand forms are normalized while loading so the rest of the engine only
//! ever sees fully typed [`DownloadSpec`] values.

use crate::error::{KilnError, Result};
use crate::platform;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Where and how a downloaded artifact is placed on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtractSpec {
    /// Target directory (absolute, or relative to the mode's default root).
    /// The literal `hosted` selects the shared build root.
    Path(String),
    /// Selective mapping of `{path-or-glob-in-archive: destination}`.
    Map(BTreeMap<String, String>),
}

fn default_true() -> bool {
    true
}

/// One way of fetching an artifact, selected by the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DownloadSpec {
    #[serde(rename = "url")]
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    #[serde(rename = "git")]
    Git {
        url: String,
        rev: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        submodules: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    #[serde(rename = "ghrel")]
    GitHubRelease {
        repo: String,
        #[serde(rename = "match")]
        asset_match: String,
        #[serde(rename = "prefer-stable", default = "default_true")]
        prefer_stable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    #[serde(rename = "ghtar")]
    GitHubTarball {
        repo: String,
        #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
        tarball_match: Option<String>,
        #[serde(rename = "prefer-stable", default = "default_true")]
        prefer_stable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    #[serde(rename = "ghtagtar")]
    GitHubTagTarball {
        repo: String,
        #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
        tarball_match: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    #[serde(rename = "bitbuckettag")]
    BitbucketTag {
        repo: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    #[serde(rename = "filelist")]
    FileList {
        url: String,
        regex: String,
        #[serde(rename = "download-url", default, skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    /// Prebuilt package from the shared package release repository.
    #[serde(rename = "hosted")]
    Hosted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
    },
    #[serde(rename = "local")]
    Local {
        dirname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<ExtractSpec>,
    },
    /// Fetch logic is supplied in code through a registered callback.
    #[serde(rename = "custom")]
    Custom,
}

impl DownloadSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Url { .. } => "url",
            Self::Git { .. } => "git",
            Self::GitHubRelease { .. } => "ghrel",
            Self::GitHubTarball { .. } => "ghtar",
            Self::GitHubTagTarball { .. } => "ghtagtar",
            Self::BitbucketTag { .. } => "bitbuckettag",
            Self::FileList { .. } => "filelist",
            Self::Hosted { .. } => "hosted",
            Self::Local { .. } => "local",
            Self::Custom => "custom",
        }
    }

    pub fn extract(&self) -> Option<&ExtractSpec> {
        match self {
            Self::Url { extract, .. }
            | Self::Git { extract, .. }
            | Self::GitHubRelease { extract, .. }
            | Self::GitHubTarball { extract, .. }
            | Self::GitHubTagTarball { extract, .. }
            | Self::BitbucketTag { extract, .. }
            | Self::FileList { extract, .. }
            | Self::Local { extract, .. } => extract.as_ref(),
            Self::Hosted { .. } | Self::Custom => None,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom)
    }

    pub fn is_hosted(&self) -> bool {
        matches!(self, Self::Hosted { .. })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Static descriptor for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactConfig {
    pub source: Option<DownloadSpec>,
    pub source_mirror: Option<DownloadSpec>,
    pub binary: BTreeMap<String, DownloadSpec>,
    pub binary_mirror: BTreeMap<String, DownloadSpec>,
    /// Subdirectory of the source dir holding the buildable tree.
    pub source_root: Option<String>,
}

impl ArtifactConfig {
    /// Parse and normalize one artifact's raw JSON descriptor.
    pub fn from_value(name: &str, raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| KilnError::validation(name, "artifact config must be an object"))?;

        let mut config = Self::default();

        if let Some(v) = non_null(obj, "source") {
            config.source = Some(parse_source_spec(name, "source", v)?);
        }
        if let Some(v) = non_null(obj, "source-mirror") {
            config.source_mirror = Some(parse_source_spec(name, "source-mirror", v)?);
        }
        if let Some(v) = non_null(obj, "binary") {
            config.binary = parse_binary_specs(name, "binary", v)?;
        }
        if let Some(v) = non_null(obj, "binary-mirror") {
            config.binary_mirror = parse_binary_specs(name, "binary-mirror", v)?;
        }
        if let Some(meta) = obj.get("metadata").and_then(Value::as_object) {
            config.source_root = meta
                .get("source-root")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        for (key, _) in obj {
            if !matches!(
                key.as_str(),
                "source" | "source-mirror" | "binary" | "binary-mirror" | "metadata"
            ) {
                debug!("Ignoring unknown key '{}' in config of {}", key, name);
            }
        }

        Ok(config)
    }
}

fn non_null<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn parse_source_spec(name: &str, slot: &str, raw: &Value) -> Result<DownloadSpec> {
    match raw {
        Value::String(s) if s == "custom" => Ok(DownloadSpec::Custom),
        Value::String(s) if is_http_url(s) => Ok(url_spec(s)),
        Value::String(s) => Err(KilnError::validation(
            name,
            format!("{} must be an object, an http(s) URL or 'custom', got '{}'", slot, s),
        )),
        Value::Object(_) => serde_json::from_value(raw.clone())
            .map_err(|e| KilnError::validation(name, format!("invalid {} config: {}", slot, e))),
        _ => Err(KilnError::validation(
            name,
            format!("{} must be an object or a string", slot),
        )),
    }
}

fn parse_binary_specs(name: &str, slot: &str, raw: &Value) -> Result<BTreeMap<String, DownloadSpec>> {
    match raw {
        Value::String(s) if s == "custom" => Ok(expand_all_platforms(DownloadSpec::Custom)),
        Value::String(s) if s == "hosted" => {
            Ok(expand_all_platforms(DownloadSpec::Hosted { repo: None }))
        }
        Value::Object(platforms) => {
            let mut specs = BTreeMap::new();
            for (platform, spec) in platforms {
                platform::validate_platform(platform).map_err(|_| {
                    KilnError::validation(
                        name,
                        format!("{} has invalid platform key '{}'", slot, platform),
                    )
                })?;
                let spec = match spec {
                    Value::String(s) if s == "hosted" => DownloadSpec::Hosted { repo: None },
                    other => parse_source_spec(name, &format!("{}.{}", slot, platform), other)?,
                };
                specs.insert(platform.clone(), spec);
            }
            Ok(specs)
        }
        _ => Err(KilnError::validation(
            name,
            format!("{} must be 'custom', 'hosted' or a map of platform to config", slot),
        )),
    }
}

fn expand_all_platforms(spec: DownloadSpec) -> BTreeMap<String, DownloadSpec> {
    platform::ALL_PLATFORMS
        .iter()
        .map(|p| (p.to_string(), spec.clone()))
        .collect()
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn url_spec(url: &str) -> DownloadSpec {
    DownloadSpec::Url {
        url: url.to_string(),
        filename: None,
        version: None,
        sha256: None,
        extract: None,
    }
}

/// Load every `*.json` file in `dir` into a map of artifact name to config.
pub fn load_dir(dir: &Path) -> Result<BTreeMap<String, ArtifactConfig>> {
    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();

    let mut configs = BTreeMap::new();
    for file in files {
        debug!("Loading artifact configs from {}", file.display());
        let content = fs::read_to_string(&file)?;
        let doc: Value = serde_json::from_str(&content)?;
        let obj = doc.as_object().ok_or_else(|| {
            KilnError::validation(
                file.display().to_string(),
                "config file must contain an object keyed by artifact name",
            )
        })?;
        for (name, raw) in obj {
            if configs.contains_key(name) {
                return Err(KilnError::validation(
                    name,
                    format!("declared twice (again in {})", file.display()),
                ));
            }
            configs.insert(name.clone(), ArtifactConfig::from_value(name, raw)?);
        }
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_shorthand() {
        let config = ArtifactConfig::from_value(
            "zlib",
            &json!({ "source": "https://zlib.net/zlib-1.3.1.tar.gz" }),
        )
        .unwrap();
        assert_eq!(
            config.source,
            Some(DownloadSpec::Url {
                url: "https://zlib.net/zlib-1.3.1.tar.gz".into(),
                filename: None,
                version: None,
                sha256: None,
                extract: None,
            })
        );
    }

    #[test]
    fn test_binary_hosted_expands_to_all_platforms() {
        let config = ArtifactConfig::from_value("zlib", &json!({ "binary": "hosted" })).unwrap();
        assert_eq!(config.binary.len(), platform::ALL_PLATFORMS.len());
        assert!(config.binary.values().all(DownloadSpec::is_hosted));
    }

    #[test]
    fn test_typed_spec_with_extract_map() {
        let config = ArtifactConfig::from_value(
            "headers",
            &json!({
                "source": {
                    "type": "ghrel",
                    "repo": "owner/headers",
                    "match": "headers.+\\.zip",
                    "extract": { "include/*.h": "{build_root_path}/include" }
                },
                "metadata": { "source-root": "src" }
            }),
        )
        .unwrap();
        let source = config.source.unwrap();
        assert_eq!(source.type_name(), "ghrel");
        assert!(matches!(source.extract(), Some(ExtractSpec::Map(m)) if m.len() == 1));
        assert_eq!(config.source_root.as_deref(), Some("src"));
    }

    #[test]
    fn test_missing_required_field_is_validation_error() {
        let err = ArtifactConfig::from_value(
            "curl",
            &json!({ "source": { "type": "git", "url": "https://github.com/curl/curl" } }),
        )
        .unwrap_err();
        assert!(matches!(err, KilnError::Validation { ref artifact, .. } if artifact == "curl"));
        assert!(err.to_string().contains("rev"));
    }

    #[test]
    fn test_invalid_platform_key() {
        let err = ArtifactConfig::from_value(
            "curl",
            &json!({ "binary": { "solaris-sparc": "https://example.com/curl.txz" } }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("solaris-sparc"));
    }

    #[test]
    fn test_load_dir_rejects_duplicates() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("a.json"), r#"{"zlib": {"source": "custom"}}"#).unwrap();
        fs::write(dir.path().join("b.json"), r#"{"zlib": {"source": "custom"}}"#).unwrap();
        assert!(load_dir(dir.path()).is_err());

        fs::remove_file(dir.path().join("b.json")).unwrap();
        let configs = load_dir(dir.path()).unwrap();
        assert_eq!(configs["zlib"].source, Some(DownloadSpec::Custom));
    }
}
