//! LedgerFS command line interface.
//!
//! Unified CLI for mounting a backing directory over FUSE and for
//! inspecting its metadata log.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// LedgerFS - append-only overlay filesystem over a two-file backing store
#[derive(Parser)]
#[command(
    name = "ledgerfs",
    about = "LedgerFS command-line interface",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a backing directory as a FUSE filesystem
    Mount(commands::mount::MountArgs),

    /// Walk a backing directory's metadata log and print its records
    Inspect(commands::inspect::InspectArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new().filter_level(log_level).init();

    info!("LedgerFS CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Mount(args) => commands::mount::run(args),
        Commands::Inspect(args) => commands::inspect::run(args),
    }
}
