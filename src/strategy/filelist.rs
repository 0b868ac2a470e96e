use super::{FetchContext, Fetcher, Resolved, compile_regex};
use crate::config::ExtractSpec;
use crate::error::{KilnError, Result};
use crate::result::DownloadResult;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use tracing::debug;

const UNSTABLE_MARKERS: &[&str] = &["alpha", "beta", "rc", "pre", "nightly", "snapshot", "dev"];

/// Newest release found by scraping a download index page.
///
/// The regex runs over the page body and must define the named groups
/// `version` and `file`.
#[derive(Debug, Clone)]
pub struct FileList {
    pub url: String,
    pub regex: Regex,
    pub download_url: Option<String>,
    pub extract: Option<ExtractSpec>,
    pub config: Value,
}

impl FileList {
    pub fn new(
        artifact: &str,
        url: &str,
        regex: &str,
        download_url: Option<String>,
        extract: Option<ExtractSpec>,
        config: Value,
    ) -> Result<Self> {
        let regex = compile_regex(artifact, "filelist", regex)?;
        let names: Vec<_> = regex.capture_names().flatten().collect();
        if !names.contains(&"version") || !names.contains(&"file") {
            return Err(KilnError::validation(
                artifact,
                "filelist regex must define the named groups 'version' and 'file'",
            ));
        }
        Ok(Self {
            url: url.to_string(),
            regex,
            download_url,
            extract,
            config,
        })
    }

    /// Highest stable `(version, file)` pair listed in `page`.
    pub fn newest(&self, page: &str) -> Option<(String, String)> {
        self.regex
            .captures_iter(page)
            .filter_map(|caps| {
                let version = caps.name("version")?.as_str();
                let file = caps.name("file")?.as_str();
                Some((version.to_string(), file.to_string()))
            })
            .filter(|(version, _)| !is_unstable_version(version))
            .max_by(|(a, _), (b, _)| compare_versions(a, b))
    }

    fn file_url(&self, version: &str, file: &str) -> String {
        match &self.download_url {
            Some(template) => template.replace("{file}", file).replace("{version}", version),
            None if self.url.ends_with('/') => format!("{}{}", self.url, file),
            None => format!("{}/{}", self.url, file),
        }
    }
}

/// Whether a version string is marked as a pre-release.
pub fn is_unstable_version(version: &str) -> bool {
    let lower = version.to_ascii_lowercase();
    UNSTABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Compare two version strings numerically, component by component.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<u64> = a.split(['.', '-', '_']).filter_map(|s| s.parse().ok()).collect();
    let b_parts: Vec<u64> = b.split(['.', '-', '_']).filter_map(|s| s.parse().ok()).collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    // Fall back to lexicographic
    a.cmp(b)
}

impl Fetcher for FileList {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        debug!("Scanning {} for {} releases", self.url, ctx.artifact);
        let page = ctx.http.get_text(&self.url, ctx.retry).await?;
        let (version, file) = self.newest(&page).ok_or_else(|| {
            KilnError::Fetch(format!(
                "no stable release of {} found at {}",
                ctx.artifact, self.url
            ))
        })?;

        // Links may carry a path; only the last segment names the download
        let name = file.rsplit('/').next().unwrap_or(&file).to_string();
        Ok(Resolved {
            location: self.file_url(&version, &file),
            name,
            version: Some(version),
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
