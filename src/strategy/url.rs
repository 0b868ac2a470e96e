use super::{FetchContext, Fetcher, Resolved, validate_sha256};
use crate::config::ExtractSpec;
use crate::error::{KilnError, Result};
use crate::result::DownloadResult;
use serde_json::Value;
use tracing::debug;

/// Plain file download from a fixed URL.
#[derive(Debug, Clone)]
pub struct Url {
    pub url: String,
    pub filename: Option<String>,
    pub version: Option<String>,
    pub sha256: Option<String>,
    pub extract: Option<ExtractSpec>,
    pub config: Value,
}

/// Last path segment of a URL, ignoring query and fragment.
pub fn url_basename(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let (_, path) = path.split_once('/')?;
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

impl Fetcher for Url {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        let name = match &self.filename {
            Some(name) => name.clone(),
            None => url_basename(&self.url)
                .ok_or_else(|| {
                    KilnError::validation(
                        &ctx.artifact,
                        format!("cannot derive a filename from '{}', set 'filename'", self.url),
                    )
                })?
                .to_string(),
        };
        Ok(Resolved {
            location: self.url.clone(),
            name,
            version: self.version.clone(),
            sha256: self.sha256.clone(),
        })
    }

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult> {
        let dest = ctx.download_path(&resolved.name);
        debug!("Downloading {} from {}", ctx.artifact, resolved.location);
        ctx.http
            .download_file(&resolved.location, &dest, None, ctx.retry)
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
