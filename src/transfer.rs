//! Network and process transfers used by the fetch strategies.
//!
//! Every operation takes a `retry` count: the number of extra attempts made
//! against the same endpoint before the failure is handed back to the
//! download queue.

use crate::error::{KilnError, Result};
use crate::report::Reporter;
use reqwest::header::{ACCEPT, CONTENT_DISPOSITION, HeaderMap};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `op` up to `retry + 1` times while it fails with a recoverable error.
pub async fn with_retry<T, F, Fut>(retry: u32, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retry && e.is_recoverable() => {
                attempt += 1;
                warn!("{} failed ({}), retrying ({}/{})", what, e, attempt, retry);
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shared HTTP client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    github_token: Option<String>,
    reporter: Reporter,
}

impl HttpClient {
    pub fn new(reporter: Reporter) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let github_token = std::env::var("GITHUB_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        Ok(Self {
            client,
            github_token,
            reporter,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.github_token {
            if is_github(url) {
                req = req.bearer_auth(token);
            }
        }
        req
    }

    pub async fn get_text(&self, url: &str, retry: u32) -> Result<String> {
        with_retry(retry, url, move || async move {
            debug!("GET {}", url);
            let response = self
                .request(reqwest::Method::GET, url)
                .send()
                .await?
                .error_for_status()?;
            Ok(response.text().await?)
        })
        .await
    }

    pub async fn get_json(&self, url: &str, retry: u32) -> Result<Value> {
        let body = self.get_text(url, retry).await?;
        serde_json::from_str(&body)
            .map_err(|e| KilnError::Fetch(format!("invalid JSON from {}: {}", url, e)))
    }

    pub async fn head(&self, url: &str, retry: u32) -> Result<HeaderMap> {
        with_retry(retry, url, move || async move {
            debug!("HEAD {}", url);
            let response = self
                .request(reqwest::Method::HEAD, url)
                .send()
                .await?
                .error_for_status()?;
            Ok(response.headers().clone())
        })
        .await
    }

    /// Stream `url` into `dest`, replacing any existing file. A partial file is
    /// removed when the transfer fails.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        accept: Option<&str>,
        retry: u32,
    ) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let label = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| url.to_string());
        let label = label.as_str();

        with_retry(retry, url, move || async move {
            let result = self.stream_to(url, dest, accept, label).await;
            if result.is_err() && dest.exists() {
                let _ = fs::remove_file(dest).await;
            }
            result
        })
        .await
    }

    async fn stream_to(&self, url: &str, dest: &Path, accept: Option<&str>, label: &str) -> Result<u64> {
        debug!("Downloading {} to {}", url, dest.display());
        let mut req = self.request(reqwest::Method::GET, url);
        if let Some(accept) = accept {
            req = req.header(ACCEPT, accept);
        }
        let mut response = req.send().await?.error_for_status()?;

        let pb = self.reporter.transfer_bar(label);
        if let Some(total) = response.content_length() {
            pb.set_length(total);
        }

        let mut file = fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }
        file.flush().await?;
        pb.finish_and_clear();

        Ok(downloaded)
    }
}

fn is_github(url: &str) -> bool {
    url.starts_with("https://api.github.com/") || url.starts_with("https://github.com/")
}

/// Filename from a `Content-Disposition: attachment; filename=...` header.
pub fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    parse_disposition(value)
}

fn parse_disposition(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let name = part.strip_prefix("filename=")?;
        let name = name.trim_matches('"');
        // Never let a server pick a path outside the download dir
        let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Clone options for [`git_clone`].
#[derive(Debug, Clone, Default)]
pub struct CloneOptions<'a> {
    pub rev: &'a str,
    pub shallow: bool,
    /// Only these submodules are initialized; empty means all, recursively.
    pub submodules: &'a [String],
}

/// Clone `url` at `rev` into `dest`, removing anything already there first.
pub async fn git_clone(url: &str, dest: &Path, opts: &CloneOptions<'_>, retry: u32) -> Result<()> {
    let result = clone_attempts(url, dest, opts, retry).await;
    if result.is_err() && dest.exists() {
        if let Err(e) = fs::remove_dir_all(dest).await {
            warn!("Failed to remove partial clone {}: {}", dest.display(), e);
        }
    }
    result
}

async fn clone_attempts(url: &str, dest: &Path, opts: &CloneOptions<'_>, retry: u32) -> Result<()> {
    with_retry(retry, url, move || async move {
        if dest.exists() {
            fs::remove_dir_all(dest).await?;
        }

        let mut args: Vec<String> = vec![
            "clone".into(),
            "--config".into(),
            "core.autocrlf=false".into(),
            "--branch".into(),
            opts.rev.to_string(),
        ];
        if opts.shallow {
            args.extend(["--depth", "1", "--single-branch"].map(String::from));
        }
        if opts.submodules.is_empty() {
            args.push("--recursive".into());
            if opts.shallow {
                args.push("--shallow-submodules".into());
            }
        }
        args.push(url.to_string());
        args.push(dest.display().to_string());
        run_git(&args).await?;

        if !opts.submodules.is_empty() {
            let mut args: Vec<String> = vec![
                "-C".into(),
                dest.display().to_string(),
                "submodule".into(),
                "update".into(),
                "--init".into(),
            ];
            if opts.shallow {
                args.extend(["--depth", "1"].map(String::from));
            }
            args.push("--".into());
            args.extend(opts.submodules.iter().cloned());
            run_git(&args).await?;
        }
        Ok(())
    })
    .await
}

async fn run_git(args: &[String]) -> Result<()> {
    let command = format!("git {}", args.join(" "));
    debug!("Running {}", command);
    let output = Command::new("git")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| KilnError::Process {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(KilnError::Process {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
