//! batchdl CLI - Command-line batch downloader
//!
//! Submits one batch of URLs, renders its progress and keeps partial files
//! on Ctrl-C so the same command picks up where it stopped.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// batchdl - resumable, chunked batch downloader
#[derive(Parser)]
#[command(name = "batchdl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for batchdl
    #[arg(long, env = "BATCHDL_DATA_DIR")]
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
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs as a single batch
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Directory to save into (defaults to the configured download path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Chunks per large file for this run
        #[arg(short, long)]
        chunks: Option<u32>,

        /// Never split files into chunks
        #[arg(long)]
        single_stream: bool,

        /// Extra request header, e.g. -H 'Authorization: Bearer x'
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Probe URLs for size and range support
    Probe {
        /// URLs to probe
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "batchdl", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("batchdl"))
            .unwrap_or_else(|| PathBuf::from(".batchdl"))
    });

    // Initialize core
    let core = batchdl_core::BatchCore::new(data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Get {
            urls,
            output,
            chunks,
            single_stream,
            headers,
        } => {
            let options = commands::GetOptions {
                output,
                chunks,
                single_stream,
                headers,
            };
            commands::get_download(&core, urls, options, cli.output).await?
        }

        Commands::Probe { urls } => commands::probe_urls(&core, urls, cli.output).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
