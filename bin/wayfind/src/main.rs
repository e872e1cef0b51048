mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "wayfind")]
#[command(about = "Inspect and maintain the wayfind selector cache", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache and store statistics
    Stats,

    /// List stored selectors for a url pattern or domain
    Query {
        /// Url pattern (exact) or domain
        target: String,

        /// Only show entries at or above this confidence
        #[arg(long, default_value = "0.0")]
        min_confidence: f64,

        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Resolve the best selector for a test id
    Lookup {
        /// Logical element name
        test_id: String,

        /// Restrict to one url pattern
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Predict the next pages after a url
    Predict {
        /// Current url pattern
        url: String,
    },

    /// Remove TTL-expired selectors
    Cleanup,

    /// Delete a selector by id
    Delete {
        /// Selector id
        id: String,
    },

    /// Manage recorded navigation history
    Navigation {
        #[command(subcommand)]
        command: NavigationCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish)
        shell: String,
    },
}

#[derive(Subcommand)]
enum NavigationCommands {
    /// Forget every recorded page transition
    Reset,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Stats => {
            commands::cache_cmd::stats().await?;
        }
        Commands::Query { target, min_confidence, limit } => {
            commands::cache_cmd::query(&target, min_confidence, limit).await?;
        }
        Commands::Lookup { test_id, url } => {
            commands::cache_cmd::lookup(&test_id, url.as_deref()).await?;
        }
        Commands::Predict { url } => {
            commands::cache_cmd::predict(&url).await?;
        }
        Commands::Cleanup => {
            commands::cache_cmd::cleanup().await?;
        }
        Commands::Delete { id } => {
            commands::cache_cmd::delete(&id).await?;
        }
        Commands::Navigation { command } => match command {
            NavigationCommands::Reset => {
                commands::cache_cmd::reset_navigation().await?;
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show().await?;
            }
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(force).await?;
            }
        },
        Commands::Completions { shell } => {
            commands::completions_cmd::run(&shell).await?;
        }
    }

    Ok(())
}
