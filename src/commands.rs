use clap::Args;
use colored::Colorize;
use kiln::{
    Artifact, ArtifactCache, ArtifactDownloader, ArtifactExtractor, ArtifactRegistry, CacheBypass,
    CacheEntry, DownloaderOptions, ExtractStatus, FetchPreference, Layout, Reporter, Result,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Source-vs-binary choice, shared by `download` and `extract`.
#[derive(Args, Debug, Default, Clone)]
pub struct PreferenceArgs {
    /// Prefer sources (bare: all artifacts, or a comma list)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "", value_name = "ARTIFACTS")]
    pub prefer_source: Option<String>,

    /// Prefer prebuilt binaries (bare: all artifacts, or a comma list)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "", value_name = "ARTIFACTS")]
    pub prefer_binary: Option<String>,

    /// Only use sources (bare: all artifacts, or a comma list)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "", value_name = "ARTIFACTS")]
    pub source_only: Option<String>,

    /// Only use binaries (bare: all artifacts, or a comma list)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "", value_name = "ARTIFACTS")]
    pub binary_only: Option<String>,
}

impl PreferenceArgs {
    /// A bare flag replaces `default`; a list adds per-artifact entries.
    pub fn apply(
        &self,
        default: &mut FetchPreference,
        per_artifact: &mut BTreeMap<String, FetchPreference>,
    ) {
        for (flag, preference) in [
            (&self.prefer_source, FetchPreference::PreferSource),
            (&self.prefer_binary, FetchPreference::PreferBinary),
            (&self.source_only, FetchPreference::SourceOnly),
            (&self.binary_only, FetchPreference::BinaryOnly),
        ] {
            match flag.as_deref() {
                None => {}
                Some("") => *default = preference,
                Some(list) => {
                    for name in split_list(list) {
                        per_artifact.insert(name.to_string(), preference);
                    }
                }
            }
        }
    }
}

/// Operator knobs for `kiln download`.
#[derive(Args, Debug, Default)]
pub struct DownloadArgs {
    /// Number of artifacts fetched concurrently
    #[arg(short = 'P', long, default_value_t = 1)]
    pub parallel: usize,

    /// Extra attempts per candidate before moving to the next one
    #[arg(short = 'R', long, default_value_t = 0)]
    pub retry: u32,

    #[command(flatten)]
    pub preference: PreferenceArgs,

    /// Re-download even when cached (bare: all artifacts, or a comma list)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "", value_name = "ARTIFACTS")]
    pub ignore_cache: Option<String>,

    /// Do not fall back to source-mirror / binary-mirror
    #[arg(long)]
    pub no_alt: bool,

    /// Clone git sources with full history
    #[arg(long)]
    pub no_shallow_clone: bool,

    /// Replace a source with a URL (name:url)
    #[arg(long, value_name = "NAME:URL")]
    pub custom_url: Vec<String>,

    /// Replace a source with a git ref (name:branch:url)
    #[arg(long, value_name = "NAME:BRANCH:URL")]
    pub custom_git: Vec<String>,

    /// Replace a source with a local directory (name:path)
    #[arg(long, value_name = "NAME:PATH")]
    pub custom_local: Vec<String>,
}

impl DownloadArgs {
    pub fn to_options(&self) -> Result<DownloaderOptions> {
        let mut options = DownloaderOptions {
            retry: self.retry,
            use_mirrors: !self.no_alt,
            shallow_clone: !self.no_shallow_clone,
            ..DownloaderOptions::default()
        }
        .with_parallel(self.parallel);

        self.preference
            .apply(&mut options.default_preference, &mut options.preferences);

        match self.ignore_cache.as_deref() {
            None => {}
            Some("") => options.cache_bypass = CacheBypass::All,
            Some(list) => {
                for name in split_list(list) {
                    options.cache_bypass.insert(name);
                }
            }
        }

        for spec in &self.custom_url {
            options.add_custom_url(spec)?;
        }
        for spec in &self.custom_git {
            options.add_custom_git(spec)?;
        }
        for spec in &self.custom_local {
            options.add_custom_local(spec)?;
        }
        Ok(options)
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Directories, cache and declared artifacts for one invocation.
pub struct Session {
    pub layout: Arc<Layout>,
    pub cache: Arc<ArtifactCache>,
    pub platform: String,
    pub registry: ArtifactRegistry,
}

impl Session {
    pub fn open(config_dir: Option<PathBuf>) -> Result<Self> {
        let platform = kiln::platform::current_platform()?;
        let layout = Arc::new(Layout::from_env(&platform)?);
        let config_dir =
            config_dir.unwrap_or_else(|| layout.working_dir.join("config").join("artifacts"));
        tracing::debug!("Loading artifact configs from {}", config_dir.display());
        let registry = ArtifactRegistry::load_dir(&config_dir)?;
        let cache = Arc::new(ArtifactCache::new(&layout.download_dir));

        Ok(Self {
            layout,
            cache,
            platform,
            registry,
        })
    }

    /// Named artifacts, or every declared one when `names` is empty.
    fn select(&self, names: &[String]) -> Result<Vec<Artifact>> {
        if names.is_empty() {
            return self
                .registry
                .names()
                .map(|name| self.registry.get(name).cloned())
                .collect();
        }
        names
            .iter()
            .map(|name| self.registry.get(name).cloned())
            .collect()
    }
}

pub async fn download(session: &Session, names: &[String], args: &DownloadArgs) -> Result<()> {
    let options = args.to_options()?;
    let artifacts = session.select(names)?;
    if artifacts.is_empty() {
        println!("{} No artifacts to download", "⚠".yellow());
        return Ok(());
    }

    let mut downloader = ArtifactDownloader::new(
        session.layout.clone(),
        session.cache.clone(),
        &session.platform,
        options,
        Reporter::new(),
    )?;
    downloader.add_all(artifacts);
    let summary = downloader.download().await?;

    println!(
        "{} {} downloaded, {} already cached",
        "✓".green().bold(),
        summary.downloaded.len().to_string().bold(),
        summary.skipped.len().to_string().bold()
    );
    Ok(())
}

/// Operator knobs for `kiln extract`.
#[derive(Args, Debug, Default)]
pub struct ExtractArgs {
    /// Install sources even when a binary is cached
    #[arg(long)]
    pub force_source: bool,

    #[command(flatten)]
    pub preference: PreferenceArgs,
}

impl ExtractArgs {
    /// Binaries win by default whenever one is cached.
    pub fn extractor(&self, session: &Session, reporter: Reporter) -> ArtifactExtractor {
        let mut default = FetchPreference::PreferBinary;
        let mut per_artifact = BTreeMap::new();
        self.preference.apply(&mut default, &mut per_artifact);

        ArtifactExtractor::new(
            session.layout.clone(),
            session.cache.clone(),
            &session.platform,
            reporter,
        )
        .with_preference(default)
        .with_preferences(&per_artifact)
    }
}

pub fn extract(session: &Session, names: &[String], args: &ExtractArgs) -> Result<()> {
    let artifacts = session.select(names)?;
    let mut extractor = args.extractor(session, Reporter::new());
    let statuses = extractor.extract_all(&artifacts, args.force_source)?;

    let fresh = statuses
        .iter()
        .filter(|(_, status)| *status == ExtractStatus::Extracted)
        .count();
    println!(
        "{} {} extracted, {} up to date",
        "✓".green().bold(),
        fresh.to_string().bold(),
        (statuses.len() - fresh).to_string().bold()
    );
    Ok(())
}

pub fn cache_list(session: &Session) -> Result<()> {
    println!("{}", "==> Download Cache".bold().green());
    println!(
        "{}: {}",
        "Location".bold(),
        session.cache.path().display().to_string().cyan()
    );
    println!();

    let entries = session.cache.entries()?;
    if entries.is_empty() {
        println!("{}", "Empty".dimmed());
        return Ok(());
    }

    for (name, record) in &entries {
        println!("{}", name.bold());
        if let Some(entry) = &record.source {
            print_entry(session, "source", entry);
        }
        for (platform, entry) in &record.binary {
            print_entry(session, &format!("binary {}", platform), entry);
        }
    }
    Ok(())
}

fn print_entry(session: &Session, slot: &str, entry: &CacheEntry) {
    let path = session.cache.full_path(entry);
    let status = if path.exists() {
        "present".green()
    } else {
        "missing".red()
    };
    println!(
        "  {:<24} {:<8} {:<12} {} {}",
        slot.cyan(),
        entry.cache_type.as_str(),
        entry.version.as_deref().unwrap_or("-"),
        status,
        entry
            .locked_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default()
            .dimmed()
    );
    println!("  {:<24} {}", "", path.display().to_string().dimmed());
}

pub fn cache_remove(
    session: &Session,
    name: &str,
    platform: Option<&str>,
    keep_files: bool,
) -> Result<()> {
    match platform {
        Some(platform) => {
            kiln::platform::validate_platform(platform)?;
            session.cache.remove_binary(name, platform, !keep_files)?;
            println!("{} Removed {} binary for {}", "✓".green(), name.bold(), platform);
        }
        None => {
            session.cache.remove_source(name, !keep_files)?;
            println!("{} Removed {} source", "✓".green(), name.bold());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_flag_sets_default_preference() {
        let args = DownloadArgs {
            parallel: 4,
            preference: PreferenceArgs {
                prefer_binary: Some(String::new()),
                binary_only: Some("zlib, openssl".into()),
                ..PreferenceArgs::default()
            },
            ..DownloadArgs::default()
        };
        let options = args.to_options().unwrap();
        assert_eq!(options.parallel, 4);
        assert_eq!(options.default_preference, FetchPreference::PreferBinary);
        assert_eq!(options.preference_for("openssl"), FetchPreference::BinaryOnly);
        assert_eq!(options.preference_for("curl"), FetchPreference::PreferBinary);
    }

    #[test]
    fn test_ignore_cache_list_and_overrides() {
        let args = DownloadArgs {
            parallel: 1,
            ignore_cache: Some("zlib".into()),
            custom_local: vec!["curl:/src/curl".into()],
            no_alt: true,
            ..DownloadArgs::default()
        };
        let options = args.to_options().unwrap();
        assert!(options.cache_bypass.applies_to("zlib"));
        assert!(options.cache_bypass.applies_to("curl"));
        assert!(!options.cache_bypass.applies_to("openssl"));
        assert!(!options.use_mirrors);
    }

    #[test]
    fn test_extract_preferences_reach_extractor() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = Arc::new(Layout::new(dir.path(), "linux-x86_64"));
        let session = Session {
            cache: Arc::new(ArtifactCache::new(&layout.download_dir)),
            layout,
            platform: "linux-x86_64".to_string(),
            registry: ArtifactRegistry::new(),
        };

        let args = ExtractArgs {
            force_source: false,
            preference: PreferenceArgs {
                source_only: Some("zlib".into()),
                ..PreferenceArgs::default()
            },
        };
        let extractor = args.extractor(&session, Reporter::silent());
        assert_eq!(extractor.preference_for("zlib"), FetchPreference::SourceOnly);
        assert_eq!(extractor.preference_for("openssl"), FetchPreference::PreferBinary);

        let args = ExtractArgs {
            preference: PreferenceArgs {
                prefer_source: Some(String::new()),
                ..PreferenceArgs::default()
            },
            ..ExtractArgs::default()
        };
        let extractor = args.extractor(&session, Reporter::silent());
        assert_eq!(extractor.preference_for("openssl"), FetchPreference::PreferSource);
    }
}
