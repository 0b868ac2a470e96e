//! Fetch strategies, one per config `type`.
//!
//! Every strategy follows the same two-step contract: [`Fetcher::resolve`]
//! turns the declarative spec into a concrete location (and version, when one
//! is known), then [`Fetcher::fetch`] materializes it in the download
//! directory and returns a [`DownloadResult`]. [`Fetcher::validate`] may
//! additionally check integrity against a checksum known from the protocol.
//!
//! Artifacts whose fetch logic cannot be expressed declaratively register a
//! [`CustomFetch`] callback, which becomes the [`Strategy::Custom`] variant.

mod bitbucket;
mod filelist;
mod git;
mod github;
mod hosted;
mod local;
mod url;

pub use bitbucket::BitbucketTag;
pub use filelist::{FileList, compare_versions, is_unstable_version};
pub use git::Git;
pub use github::{GitHubRelease, GitHubTarball, TarballSource};
pub use hosted::{HOSTED_REPO, Hosted, hosted_asset_pattern};
pub use local::Local;
pub use url::{Url, url_basename};

use crate::config::DownloadSpec;
use crate::error::{KilnError, Result};
use crate::paths::Layout;
use crate::result::DownloadResult;
use crate::transfer::HttpClient;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fetch callback registered in code for one artifact.
pub type CustomFetch = Arc<dyn Fn(FetchContext) -> BoxFuture<'static, Result<DownloadResult>> + Send + Sync>;

/// Wrap an async closure as a [`CustomFetch`].
pub fn custom_fetch<F, Fut>(f: F) -> CustomFetch
where
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<DownloadResult>> + Send + 'static,
{
    Arc::new(move |ctx: FetchContext| -> BoxFuture<'static, Result<DownloadResult>> {
        Box::pin(f(ctx))
    })
}

/// Everything a strategy needs to know about the current run.
#[derive(Clone)]
pub struct FetchContext {
    pub artifact: String,
    pub layout: Arc<Layout>,
    pub http: HttpClient,
    /// Platform binaries are fetched for.
    pub platform: String,
    pub retry: u32,
    pub shallow_clone: bool,
    release_listings: Arc<Mutex<HashMap<String, Value>>>,
}

impl FetchContext {
    pub fn new(artifact: &str, layout: Arc<Layout>, http: HttpClient, platform: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
            layout,
            http,
            platform: platform.to_string(),
            retry: 0,
            shallow_clone: true,
            release_listings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Same run state, different artifact.
    pub fn for_artifact(&self, artifact: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
            ..self.clone()
        }
    }

    pub fn download_path(&self, filename: &str) -> PathBuf {
        self.layout.download_dir.join(filename)
    }

    /// GET a JSON listing once per run; later calls reuse the first response.
    pub async fn cached_listing(&self, url: &str) -> Result<Value> {
        let mut listings = self.release_listings.lock().await;
        if let Some(listing) = listings.get(url) {
            return Ok(listing.clone());
        }
        let listing = self.http.get_json(url, self.retry).await?;
        listings.insert(url.to_string(), listing.clone());
        Ok(listing)
    }
}

/// Concrete target of one fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    /// URL, repository or directory to fetch from.
    pub location: String,
    /// File or directory name used in the download dir.
    pub name: String,
    pub version: Option<String>,
    /// Checksum advertised by the source itself.
    pub sha256: Option<String>,
}

#[allow(async_fn_in_trait)]
pub trait Fetcher {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved>;

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult>;

    /// Returns `Ok(true)` when integrity was confirmed, `Ok(false)` when there
    /// was nothing to check against, and an integrity error on mismatch.
    fn validate(&self, _ctx: &FetchContext, _resolved: &Resolved, _result: &DownloadResult) -> Result<bool> {
        Ok(false)
    }
}

/// Closed set of fetch strategies.
#[derive(Clone)]
pub enum Strategy {
    Url(Url),
    Git(Git),
    GitHubRelease(GitHubRelease),
    GitHubTarball(GitHubTarball),
    BitbucketTag(BitbucketTag),
    FileList(FileList),
    Hosted(Hosted),
    Local(Local),
    Custom(CustomFetch),
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Strategy::{}", self.kind())
    }
}

impl Strategy {
    /// Build the strategy for a declared spec. `custom` specs need a callback.
    pub fn from_spec(artifact: &str, spec: &DownloadSpec, custom: Option<&CustomFetch>) -> Result<Self> {
        let config = spec.to_value();
        let extract = spec.extract().cloned();
        Ok(match spec {
            DownloadSpec::Url {
                url,
                filename,
                version,
                sha256,
                ..
            } => Self::Url(Url {
                url: url.clone(),
                filename: filename.clone(),
                version: version.clone(),
                sha256: sha256.clone(),
                extract,
                config,
            }),
            DownloadSpec::Git {
                url, rev, submodules, ..
            } => Self::Git(Git {
                url: url.clone(),
                rev: rev.clone(),
                submodules: submodules.clone(),
                extract,
                config,
            }),
            DownloadSpec::GitHubRelease {
                repo,
                asset_match,
                prefer_stable,
                ..
            } => Self::GitHubRelease(GitHubRelease::new(
                artifact,
                repo,
                asset_match,
                *prefer_stable,
                extract,
                config,
            )?),
            DownloadSpec::GitHubTarball {
                repo,
                tarball_match,
                prefer_stable,
                ..
            } => Self::GitHubTarball(GitHubTarball::new(
                artifact,
                repo,
                TarballSource::Releases {
                    prefer_stable: *prefer_stable,
                },
                tarball_match.as_deref(),
                extract,
                config,
            )?),
            DownloadSpec::GitHubTagTarball {
                repo, tarball_match, ..
            } => Self::GitHubTarball(GitHubTarball::new(
                artifact,
                repo,
                TarballSource::Tags,
                tarball_match.as_deref(),
                extract,
                config,
            )?),
            DownloadSpec::BitbucketTag { repo, .. } => Self::BitbucketTag(BitbucketTag {
                repo: repo.clone(),
                extract,
                config,
            }),
            DownloadSpec::FileList {
                url,
                regex,
                download_url,
                ..
            } => Self::FileList(FileList::new(
                artifact,
                url,
                regex,
                download_url.clone(),
                extract,
                config,
            )?),
            DownloadSpec::Hosted { repo } => Self::Hosted(Hosted {
                repo: repo.clone().unwrap_or_else(|| HOSTED_REPO.to_string()),
                config,
            }),
            DownloadSpec::Local { dirname, .. } => Self::Local(Local {
                dirname: dirname.clone(),
                extract,
                config,
            }),
            DownloadSpec::Custom => match custom {
                Some(callback) => Self::Custom(callback.clone()),
                None => {
                    return Err(KilnError::validation(
                        artifact,
                        "config type is 'custom' but no custom fetch callback is registered",
                    ));
                }
            },
        })
    }

    /// Config `type` this strategy serves.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Url(_) => "url",
            Self::Git(_) => "git",
            Self::GitHubRelease(_) => "ghrel",
            Self::GitHubTarball(t) => t.kind(),
            Self::BitbucketTag(_) => "bitbuckettag",
            Self::FileList(_) => "filelist",
            Self::Hosted(_) => "hosted",
            Self::Local(_) => "local",
            Self::Custom(_) => "custom",
        }
    }
}

impl Fetcher for Strategy {
    async fn resolve(&self, ctx: &FetchContext) -> Result<Resolved> {
        match self {
            Self::Url(s) => s.resolve(ctx).await,
            Self::Git(s) => s.resolve(ctx).await,
            Self::GitHubRelease(s) => s.resolve(ctx).await,
            Self::GitHubTarball(s) => s.resolve(ctx).await,
            Self::BitbucketTag(s) => s.resolve(ctx).await,
            Self::FileList(s) => s.resolve(ctx).await,
            Self::Hosted(s) => s.resolve(ctx).await,
            Self::Local(s) => s.resolve(ctx).await,
            Self::Custom(_) => Ok(Resolved {
                location: "custom callback".to_string(),
                name: ctx.artifact.clone(),
                ..Resolved::default()
            }),
        }
    }

    async fn fetch(&self, ctx: &FetchContext, resolved: &Resolved) -> Result<DownloadResult> {
        match self {
            Self::Url(s) => s.fetch(ctx, resolved).await,
            Self::Git(s) => s.fetch(ctx, resolved).await,
            Self::GitHubRelease(s) => s.fetch(ctx, resolved).await,
            Self::GitHubTarball(s) => s.fetch(ctx, resolved).await,
            Self::BitbucketTag(s) => s.fetch(ctx, resolved).await,
            Self::FileList(s) => s.fetch(ctx, resolved).await,
            Self::Hosted(s) => s.fetch(ctx, resolved).await,
            Self::Local(s) => s.fetch(ctx, resolved).await,
            Self::Custom(callback) => callback(ctx.clone()).await,
        }
    }

    fn validate(&self, ctx: &FetchContext, resolved: &Resolved, result: &DownloadResult) -> Result<bool> {
        match self {
            Self::Url(s) => s.validate(ctx, resolved, result),
            Self::GitHubRelease(s) => s.validate(ctx, resolved, result),
            Self::Hosted(s) => s.validate(ctx, resolved, result),
            _ => Ok(false),
        }
    }
}

/// Verify a file-based result against a known sha256, if both exist.
fn validate_sha256(ctx: &FetchContext, expected: Option<&str>, result: &DownloadResult) -> Result<bool> {
    match (expected, result.filename()) {
        (Some(expected), Some(filename)) => {
            crate::checksum::verify_sha256(&ctx.artifact, &ctx.download_path(filename), expected)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Compile a user-supplied regex, reporting failures as config errors.
fn compile_regex(artifact: &str, field: &str, pattern: &str) -> Result<regex::Regex> {
    regex::Regex::new(pattern)
        .map_err(|e| KilnError::validation(artifact, format!("invalid {} regex '{}': {}", field, pattern, e)))
}
