// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-pipeline")]
#[command(about = "Run the capture pipeline engine against a simulated camera")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Capture-mode descriptor (TOML); defaults to a compact simulated mode
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print session statistics as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream preview frames and report what happened
    Preview {
        /// Frames to generate before stopping
        #[arg(short, long, default_value = "60")]
        frames: u64,
    },

    /// Take still pictures from the running preview
    Capture {
        /// Pictures in the sequence
        #[arg(short, long, default_value = "1")]
        shots: u32,

        /// Bracket the shots on consecutive frames
        #[arg(long, conflicts_with = "flash")]
        hdr: bool,

        /// Pick the frame lit by the main flash
        #[arg(long)]
        flash: bool,

        /// Hold raw frames only once the capture is triggered
        #[arg(long)]
        dynamic: bool,
    },

    /// Record video frames for a while
    Record {
        /// Recording duration in seconds
        #[arg(short, long, default_value = "3")]
        seconds: u64,
    },

    /// Print the capture-mode descriptor
    Config {
        /// Write it to the config path instead
        #[arg(short, long)]
        write: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camera_pipeline=trace, RUST_LOG=info
    let fallback = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let output = cli::Output { json: cli.json };
    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Preview { frames } => cli::run_preview(config, frames, output),
        Commands::Capture {
            shots,
            hdr,
            flash,
            dynamic,
        } => cli::take_pictures(config, shots, cli::Trigger { hdr, flash, dynamic }, output),
        Commands::Record { seconds } => cli::record(config, seconds, output),
        Commands::Config { write } => cli::show_config(&config, cli.config, write),
    }
}
