//! Synset CLI
//!
//! Command-line tools for exercising replicated sets.
//!
//! # Commands
//!
//! - `simulate` - Run a simulated cluster and check that it converges
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Synset command-line tools.
#[derive(Parser)]
#[command(name = "synset")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster of replicas over an in-memory broker
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Number of random operations to issue
        #[arg(short, long, default_value = "100")]
        ops: usize,

        /// Seed for the operation generator (random if omitted)
        #[arg(short, long)]
        seed: Option<u64>,

        /// Take the broker down for the middle third of the run
        #[arg(short, long)]
        partition: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            nodes,
            ops,
            seed,
            partition,
            format,
        } => {
            commands::simulate::run(nodes, ops, seed, partition, &format)?;
        }
        Commands::Version => {
            println!("Synset CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Synset Engine v{}", synset_engine::VERSION);
        }
    }

    Ok(())
}
