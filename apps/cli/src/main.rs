//! Castload CLI - podcast episode downloader
//!
//! Registers episodes, drives the download engine, and renders progress in
//! the terminal.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use castload_core::{
    DownloadManager, NotificationSink, PollingConstraintMonitor, SqliteEpisodeStore,
};
use castload_types::DownloadSettings;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Castload - Podcast Episode Downloader
#[derive(Parser)]
#[command(name = "castload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Castload
    #[arg(long, env = "CASTLOAD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Register episodes by URL and download them
    Add {
        /// Episode URLs to download
        urls: Vec<String>,

        /// Podcast uuid the episodes belong to
        #[arg(short, long)]
        podcast: Option<String>,

        /// Title prefix for the registered episodes
        #[arg(short, long)]
        title: Option<String>,

        /// Treat the request as an automatic download (honors the
        /// unmetered/power settings instead of running immediately)
        #[arg(long)]
        automatic: bool,
    },

    /// Download episodes that are already registered
    Download {
        /// Episode uuids
        uuids: Vec<String>,

        /// Treat the request as an automatic download
        #[arg(long)]
        automatic: bool,
    },

    /// List registered episodes
    List {
        /// Filter by status (substring match, e.g. "failed")
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Cancel downloads
    Cancel {
        /// Episode uuids to cancel
        uuids: Vec<String>,

        /// Cancel every episode of this podcast instead
        #[arg(short, long)]
        podcast: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("castload_cli=debug,castload_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = &cli.command {
        use clap::CommandFactory;
        clap_complete::generate(*shell, &mut Cli::command(), "castload", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("castload"))
            .unwrap_or_else(|| PathBuf::from(".castload"))
    });

    let store = Arc::new(SqliteEpisodeStore::new(data_dir.join("episodes.db")).await?);
    let monitor = PollingConstraintMonitor::unconstrained();
    monitor.start();

    let sink: Arc<dyn NotificationSink> = match cli.output {
        OutputFormat::Human => Arc::new(progress::TerminalNotificationSink::new()),
        OutputFormat::Json => Arc::new(castload_core::NullNotificationSink),
    };

    let manager = DownloadManager::new(
        store.clone(),
        DownloadSettings::default(),
        monitor.subscribe(),
        sink,
        data_dir,
    )?;
    manager.monitor_download_status();

    match cli.command {
        Commands::Add {
            urls,
            podcast,
            title,
            automatic,
        } => commands::add_episodes(&manager, &store, urls, podcast, title, automatic, cli.output).await?,

        Commands::Download { uuids, automatic } => {
            commands::download_episodes(&manager, &store, uuids, automatic, cli.output).await?
        }

        Commands::List { status } => commands::list_episodes(&store, status, cli.output).await?,

        Commands::Cancel { uuids, podcast } => {
            commands::cancel_downloads(&manager, uuids, podcast, cli.output).await?
        }

        Commands::Completions { .. } => unreachable!("handled before initialization"),
    }

    Ok(())
}
