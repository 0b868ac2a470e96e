use super::{FetchContext, Fetcher, Resolved};
use crate::config::ExtractSpec;
use crate::error::{KilnError, Result};
use crate::result::DownloadResult;
use serde_json::Value;

const API_URL: &str = "https://api.bitbucket.org/2.0/repositories/{repo}/refs/tags";
const DOWNLOAD_URL: &str = "https://bitbucket.org/{repo}/get/{version}.tar.gz";

/// Tarball of the newest tag of a Bitbucket repository.
#[derive(Debug, Clone)]
pub struct BitbucketTag {
    pub repo: String,
    pub extract: Option<ExtractSpec>,
    pub config: Value,
}

impl Fetcher for BitbucketTag {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        let api = API_URL.replace("{repo}", &self.repo);
        let data = ctx.http.get_json(&api, ctx.retry).await?;
        let version = data["values"][0]["name"]
            .as_str()
            .ok_or_else(|| KilnError::Fetch(format!("no tags found for {} at {}", self.repo, api)))?;

        Ok(Resolved {
            location: DOWNLOAD_URL
                .replace("{repo}", &self.repo)
                .replace("{version}", version),
            name: format!("{}-{}.tar.gz", ctx.artifact, version),
            version: Some(version.to_string()),
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
