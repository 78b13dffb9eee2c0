//! drift: operator commands against a local log store. Exit codes map
//! the error taxonomy; zero means ok.

mod store_cmd;

use clap::{Parser, Subcommand};
use drift_config::logging::{init_logging, LogLevel};
use drift_config::Config;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "drift")]
#[command(version, about = "drift operator tool", long_about = None)]
struct Cli {
    /// Store directory (defaults to the configured store path)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a node config template to ./drift.toml
    Init,
    /// Create a new store
    Fmt,
    /// Show capacity and free-space numbers
    Df,
    /// Run one cleaner pass
    Clean {
        /// Most segments to reclaim in this pass
        #[arg(long, default_value_t = 4)]
        max_segments: usize,
    },
    /// Verify the usage-map invariants
    Check,
}

fn main() -> ExitCode {
    init_logging(LogLevel::Warn);

    let cli = Cli::parse();
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("drift: config unusable ({e}), using defaults");
        Config::default()
    });
    let store = cli
        .store
        .unwrap_or_else(|| config.store_path().to_path_buf());

    let result = match cli.command {
        Commands::Init => store_cmd::init(),
        Commands::Fmt => store_cmd::fmt(&store, &config),
        Commands::Df => store_cmd::df(&store, &config),
        Commands::Clean { max_segments } => store_cmd::clean(&store, &config, max_segments),
        Commands::Check => store_cmd::check(&store, &config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("drift: {e}");
            ExitCode::from(store_cmd::status_of(&e).exit_code() as u8)
        }
    }
}
