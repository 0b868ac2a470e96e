mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{DownloadArgs, ExtractArgs, Session};
use kiln::KilnError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Fetch, cache and install third-party build artifacts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory with artifact config files [default: {working}/config/artifacts]
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download artifacts into the download cache
    Download {
        /// Artifact names (all declared artifacts if empty)
        artifacts: Vec<String>,

        #[command(flatten)]
        args: DownloadArgs,
    },

    /// Install downloaded artifacts into the source tree or package root
    Extract {
        /// Artifact names (all declared artifacts if empty)
        artifacts: Vec<String>,

        #[command(flatten)]
        args: ExtractArgs,
    },

    /// Inspect or edit the download cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached downloads
    List,

    /// Forget a cached download and delete its files
    Remove {
        /// Artifact name
        artifact: String,

        /// Remove the binary for this platform instead of the source
        #[arg(long)]
        platform: Option<String>,

        /// Keep the downloaded files, only drop the cache entry
        #[arg(long)]
        keep_files: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    kiln::logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        if matches!(e.downcast_ref::<KilnError>(), Some(KilnError::Cancelled)) {
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(2);
        }
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let session = Session::open(cli.config_dir)?;

    match cli.command {
        Commands::Download { artifacts, args } => {
            commands::download(&session, &artifacts, &args).await?;
        }
        Commands::Extract { artifacts, args } => {
            commands::extract(&session, &artifacts, &args)?;
        }
        Commands::Cache { action } => match action {
            CacheAction::List => commands::cache_list(&session)?,
            CacheAction::Remove {
                artifact,
                platform,
                keep_files,
            } => commands::cache_remove(&session, &artifact, platform.as_deref(), keep_files)?,
        },
    }

    Ok(())
}
