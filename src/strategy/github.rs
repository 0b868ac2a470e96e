use super::{FetchContext, Fetcher, Resolved, compile_regex, validate_sha256};
use crate::config::ExtractSpec;
use crate::error::{KilnError, Result};
use crate::result::DownloadResult;
use crate::transfer;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

const API_BASE: &str = "https://api.github.com/repos";

fn releases_url(repo: &str) -> String {
    format!("{}/{}/releases", API_BASE, repo)
}

fn is_prerelease(release: &Value) -> bool {
    release["prerelease"].as_bool().unwrap_or(false)
}

/// Asset attached to the newest matching GitHub release.
#[derive(Debug, Clone)]
pub struct GitHubRelease {
    pub repo: String,
    pub asset_match: Regex,
    pub prefer_stable: bool,
    pub extract: Option<ExtractSpec>,
    pub config: Value,
}

impl GitHubRelease {
    pub fn new(
        artifact: &str,
        repo: &str,
        asset_match: &str,
        prefer_stable: bool,
        extract: Option<ExtractSpec>,
        config: Value,
    ) -> Result<Self> {
        Ok(Self {
            repo: repo.to_string(),
            asset_match: compile_regex(artifact, "match", asset_match)?,
            prefer_stable,
            extract,
            config,
        })
    }

    /// Pick the first asset matching the pattern from a release listing.
    pub fn select_asset(&self, releases: &Value) -> Option<Resolved> {
        let releases = releases.as_array()?;
        for release in releases {
            if self.prefer_stable && is_prerelease(release) {
                continue;
            }
            let Some(assets) = release["assets"].as_array() else {
                continue;
            };
            for asset in assets {
                let (Some(name), Some(id)) = (asset["name"].as_str(), asset["id"].as_u64()) else {
                    continue;
                };
                if !self.asset_match.is_match(name) {
                    continue;
                }
                let sha256 = asset["digest"]
                    .as_str()
                    .and_then(|d| d.strip_prefix("sha256:"))
                    .map(str::to_string);
                return Some(Resolved {
                    location: format!("{}/{}/releases/assets/{}", API_BASE, self.repo, id),
                    name: name.to_string(),
                    version: release["tag_name"].as_str().map(str::to_string),
                    sha256,
                });
            }
        }
        None
    }
}

impl Fetcher for GitHubRelease {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        debug!("Fetching {} GitHub releases from {}", ctx.artifact, self.repo);
        let releases = ctx.http.get_json(&releases_url(&self.repo), ctx.retry).await?;
        self.select_asset(&releases).ok_or_else(|| {
            KilnError::Fetch(format!(
                "no GitHub release asset of {} matches '{}'",
                self.repo, self.asset_match
            ))
        })
    }

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult> {
        let dest = ctx.download_path(&resolved.name);
        ctx.http
            .download_file(
                &resolved.location,
                &dest,
                Some("application/octet-stream"),
                ctx.retry,
            )
            .await?;
        Ok(
            DownloadResult::archive(&ctx.layout.download_dir, &resolved.name, self.config.clone())?
                .with_extract(self.extract.clone())
                .with_version(resolved.version.clone()),
        )
    }

    fn validate(&self, ctx: &FetchContext, resolved: &Resolved, result: &DownloadResult) -> Result<bool> {
        validate_sha256(ctx, resolved.sha256.as_deref(), result)
    }
}

/// Which GitHub listing a tarball comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarballSource {
    Releases { prefer_stable: bool },
    Tags,
}

/// Source tarball of the newest GitHub release or tag.
#[derive(Debug, Clone)]
pub struct GitHubTarball {
    pub repo: String,
    pub source: TarballSource,
    pub tarball_match: Option<Regex>,
    pub extract: Option<ExtractSpec>,
    pub config: Value,
}

impl GitHubTarball {
    pub fn new(
        artifact: &str,
        repo: &str,
        source: TarballSource,
        tarball_match: Option<&str>,
        extract: Option<ExtractSpec>,
        config: Value,
    ) -> Result<Self> {
        Ok(Self {
            repo: repo.to_string(),
            source,
            tarball_match: tarball_match
                .map(|pattern| compile_regex(artifact, "match", pattern))
                .transpose()?,
            extract,
            config,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self.source {
            TarballSource::Releases { .. } => "ghtar",
            TarballSource::Tags => "ghtagtar",
        }
    }

    fn listing_url(&self) -> String {
        match self.source {
            TarballSource::Releases { .. } => releases_url(&self.repo),
            TarballSource::Tags => format!("{}/{}/tags", API_BASE, self.repo),
        }
    }

    /// First entry with a tarball URL accepted by the filters, as `(url, version)`.
    pub fn select_tarball(&self, listing: &Value) -> Option<(String, Option<String>)> {
        let skip_prerelease = matches!(self.source, TarballSource::Releases { prefer_stable: true });
        listing.as_array()?.iter().find_map(|entry| {
            if skip_prerelease && is_prerelease(entry) {
                return None;
            }
            let url = entry["tarball_url"].as_str()?;
            if let Some(pattern) = &self.tarball_match {
                if !pattern.is_match(url) {
                    return None;
                }
            }
            let version = match self.source {
                TarballSource::Releases { .. } => entry["tag_name"].as_str(),
                TarballSource::Tags => entry["name"].as_str(),
            };
            Some((url.to_string(), version.map(str::to_string)))
        })
    }
}

impl Fetcher for GitHubTarball {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        let listing = ctx.http.get_json(&self.listing_url(), ctx.retry).await?;
        let (url, version) = self
            .select_tarball(&listing)
            .ok_or_else(|| KilnError::Fetch(format!("no suitable GitHub tarball found for {}", self.repo)))?;

        let headers = ctx.http.head(&url, ctx.retry).await?;
        let name = transfer::disposition_filename(&headers).unwrap_or_else(|| {
            format!(
                "{}-{}.tar.gz",
                ctx.artifact,
                version.as_deref().unwrap_or("latest")
            )
        });

        Ok(Resolved {
            location: url,
            name,
            version,
            sha256: None,
        })
    }

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult> {
        let dest = ctx.download_path(&resolved.name);
        ctx.http
            .download_file(&resolved.location, &dest, None, ctx.retry)
            .await?;
        Ok(
            DownloadResult::archive(&ctx.layout.download_dir, &resolved.name, self.config.clone())?
                .with_extract(self.extract.clone())
                .with_version(resolved.version.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn release(tag: &str, prerelease: bool, assets: Value) -> Value {
        json!({ "tag_name": tag, "prerelease": prerelease, "assets": assets,
                "tarball_url": format!("https://api.github.com/repos/o/r/tarball/{}", tag) })
    }

    #[test]
    fn test_select_asset_skips_prereleases() {
        let ghrel = GitHubRelease::new("tool", "o/r", r"tool-.+\.tar\.gz", true, None, json!({})).unwrap();
        let listing = json!([
            release("v2.0.0-rc1", true, json!([{ "id": 2, "name": "tool-2.0.0.tar.gz" }])),
            release("v1.9.0", false, json!([
                { "id": 10, "name": "checksums.txt" },
                { "id": 11, "name": "tool-1.9.0.tar.gz", "digest": "sha256:abcd" }
            ])),
        ]);
        let resolved = ghrel.select_asset(&listing).unwrap();
        assert_eq!(resolved.name, "tool-1.9.0.tar.gz");
        assert_eq!(resolved.version.as_deref(), Some("v1.9.0"));
        assert_eq!(resolved.sha256.as_deref(), Some("abcd"));
        assert!(resolved.location.ends_with("/releases/assets/11"));
    }

    #[test]
    fn test_select_asset_allows_prereleases_when_not_stable() {
        let ghrel = GitHubRelease::new("tool", "o/r", r"tool-.+\.tar\.gz", false, None, json!({})).unwrap();
        let listing = json!([release("v2.0.0-rc1", true, json!([{ "id": 2, "name": "tool-2.0.0.tar.gz" }]))]);
        assert_eq!(ghrel.select_asset(&listing).unwrap().version.as_deref(), Some("v2.0.0-rc1"));
    }

    #[test]
    fn test_select_tarball_from_tags() {
        let tar = GitHubTarball::new("lib", "o/r", TarballSource::Tags, None, None, json!({})).unwrap();
        let listing = json!([{ "name": "v3.1", "tarball_url": "https://api.github.com/repos/o/r/tarball/v3.1" }]);
        let (url, version) = tar.select_tarball(&listing).unwrap();
        assert!(url.ends_with("v3.1"));
        assert_eq!(version.as_deref(), Some("v3.1"));
        assert_eq!(tar.kind(), "ghtagtar");
    }

    #[test]
    fn test_select_tarball_with_match() {
        let tar = GitHubTarball::new(
            "lib",
            "o/r",
            TarballSource::Releases { prefer_stable: true },
            Some("v1\\."),
            None,
            json!({}),
        )
        .unwrap();
        let listing = json!([release("v2.0", false, json!([])), release("v1.5", false, json!([]))]);
        let (_, version) = tar.select_tarball(&listing).unwrap();
        assert_eq!(version.as_deref(), Some("v1.5"));
    }
}
