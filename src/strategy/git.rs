use super::{FetchContext, Fetcher, Resolved};
use crate::config::ExtractSpec;
use crate::error::Result;
use crate::result::DownloadResult;
use crate::transfer::{self, CloneOptions};
use serde_json::Value;
use tracing::info;

/// Clone of a git repository at a branch or tag.
#[derive(Debug, Clone)]
pub struct Git {
    pub url: String,
    pub rev: String,
    pub submodules: Vec<String>,
    pub extract: Option<ExtractSpec>,
    pub config: Value,
}

impl Fetcher for Git {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        Ok(Resolved {
            location: self.url.clone(),
            name: ctx.artifact.clone(),
            version: Some(self.rev.clone()),
            sha256: None,
        })
    }

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult> {
        let dest = ctx.download_path(&resolved.name);
        info!("Cloning {} ({}) into {}", resolved.location, self.rev, dest.display());
        let opts = CloneOptions {
            rev: &self.rev,
            shallow: ctx.shallow_clone,
            submodules: &self.submodules,
        };
        transfer::git_clone(&resolved.location, &dest, &opts, ctx.retry).await?;
        Ok(
            DownloadResult::git(&ctx.layout.download_dir, &resolved.name, self.config.clone())?
                .with_extract(self.extract.clone())
                .with_version(resolved.version.clone()),
        )
    }
}
