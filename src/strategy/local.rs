use super::{FetchContext, Fetcher, Resolved};
use crate::config::ExtractSpec;
use crate::error::{KilnError, Result};
use crate::result::DownloadResult;
use serde_json::Value;
use std::path::Path;

/// A directory already on this machine, used in place.
#[derive(Debug, Clone)]
pub struct Local {
    pub dirname: String,
    pub extract: Option<ExtractSpec>,
    pub config: Value,
}

impl Fetcher for Local {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        let expanded = ctx.layout.substitute(&self.dirname, &ctx.artifact);
        let path = Path::new(&expanded);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            ctx.layout.working_dir.join(path)
        };
        Ok(Resolved {
            location: path.display().to_string(),
            name: path.display().to_string(),
            ..Resolved::default()
        })
    }

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult> {
        let path = Path::new(&resolved.location);
        if !path.is_dir() {
            return Err(KilnError::Fetch(format!(
                "local source directory {} for {} does not exist",
                path.display(),
                ctx.artifact
            )));
        }
        Ok(DownloadResult::local(path, self.config.clone())?.with_extract(self.extract.clone()))
    }
}
