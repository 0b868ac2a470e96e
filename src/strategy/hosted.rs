use super::{FetchContext, Fetcher, Resolved};
use crate::error::{KilnError, Result};
use crate::platform;
use crate::result::DownloadResult;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Release repository holding prebuilt dependency packages.
pub const HOSTED_REPO: &str = "static-php/package-bin";

/// Prebuilt package from the newest release of the package repository.
///
/// The release listing is fetched once per run and shared by every artifact.
#[derive(Debug, Clone)]
pub struct Hosted {
    pub repo: String,
    pub config: Value,
}

/// Asset name pattern for a package on a platform.
///
/// - linux: `{name}-{arch}-linux-{libc}-{libc-version}.txz`
/// - macos: `{name}-{arch}-macos.txz`
/// - windows: `{name}-{arch}-windows.tgz`
pub fn hosted_asset_pattern(name: &str, platform_str: &str) -> Result<String> {
    let (os, arch) = platform::split_platform(platform_str).ok_or_else(|| {
        KilnError::validation(name, format!("invalid platform '{}'", platform_str))
    })?;
    let prefix = regex::escape(&format!("{}-{}-{}", name, arch, os));
    Ok(match os {
        "linux" => format!("^{}-{}-[0-9.]+\\.txz$", prefix, libc_name()),
        "windows" => format!("^{}\\.tgz$", prefix),
        _ => format!("^{}\\.txz$", prefix),
    })
}

fn libc_name() -> &'static str {
    if cfg!(target_env = "musl") { "musl" } else { "glibc" }
}

impl Fetcher for Hosted {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        let url = format!("https://api.github.com/repos/{}/releases", self.repo);
        let releases = ctx.cached_listing(&url).await?;
        let release = releases
            .as_array()
            .and_then(|r| r.first())
            .ok_or_else(|| KilnError::Fetch(format!("no releases found in {}", self.repo)))?;

        let pattern = hosted_asset_pattern(&ctx.artifact, &ctx.platform)?;
        let matcher = Regex::new(&pattern)
            .map_err(|e| KilnError::validation(&ctx.artifact, e.to_string()))?;
        debug!("Looking for hosted asset matching {}", pattern);

        let asset = release["assets"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|asset| asset["name"].as_str().is_some_and(|n| matcher.is_match(n)))
            .ok_or_else(|| {
                KilnError::Fetch(format!(
                    "no hosted package of {} for {} in {}",
                    ctx.artifact, ctx.platform, self.repo
                ))
            })?;

        let name = asset["name"].as_str().unwrap_or_default().to_string();
        let location = asset["browser_download_url"]
            .as_str()
            .ok_or_else(|| KilnError::Fetch(format!("hosted asset {} has no download URL", name)))?
            .to_string();
        let version = release["tag_name"]
            .as_str()
            .map(|tag| tag.trim_start_matches('v').to_string());

        Ok(Resolved {
            location,
            name,
            version,
            sha256: asset["digest"]
                .as_str()
                .and_then(|d| d.strip_prefix("sha256:"))
                .map(str::to_string),
        })
    }

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult> {
        let dest = ctx.download_path(&resolved.name);
        ctx.http
            .download_file(&resolved.location, &dest, None, ctx.retry)
            .await?;
        Ok(
            DownloadResult::archive(&ctx.layout.download_dir, &resolved.name, self.config.clone())?
                .with_version(resolved.version.clone()),
        )
    }

    fn validate(&self, ctx: &FetchContext, resolved: &Resolved, result: &DownloadResult) -> Result<bool> {
        super::validate_sha256(ctx, resolved.sha256.as_deref(), result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_patterns() {
        let mac = Regex::new(&hosted_asset_pattern("zlib", "macos-aarch64").unwrap()).unwrap();
        assert!(mac.is_match("zlib-aarch64-macos.txz"));
        assert!(!mac.is_match("zlib-x86_64-macos.txz"));

        let win = Regex::new(&hosted_asset_pattern("zlib", "windows-x86_64").unwrap()).unwrap();
        assert!(win.is_match("zlib-x86_64-windows.tgz"));

        let linux = Regex::new(&hosted_asset_pattern("zlib", "linux-x86_64").unwrap()).unwrap();
        let libc = libc_name();
        assert!(linux.is_match(&format!("zlib-x86_64-linux-{}-2.17.txz", libc)));
        assert!(!linux.is_match("zlib-x86_64-linux.txz"));
    }
}
