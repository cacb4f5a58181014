//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Personalized digest orchestrator
#[derive(Parser)]
#[command(name = "digest-cli")]
#[command(about = "Generate personalized content digests with an agent workflow")]
#[command(version)]
pub struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate one digest and print it as JSON
    Run {
        /// User to generate the digest for
        #[arg(short, long)]
        user: String,
        /// Free-text request steering discovery
        #[arg(short, long)]
        prompt: Option<String>,
        /// Comma-separated topics overriding the learned profile
        #[arg(short, long, value_delimiter = ',')]
        topics: Vec<String>,
        #[arg(long, default_value_t = 10)]
        max_articles: usize,
    },
    /// Generate a digest, rate it, and show how the profile moved
    Simulate {
        #[arg(short, long)]
        user: String,
        /// Topic the generated digest is about
        #[arg(short, long)]
        topic: String,
        /// Rating given to the digest, 1 to 5
        #[arg(short, long, default_value_t = 5.0)]
        rating: f64,
    },
    /// Print the effective configuration as TOML
    Config,
}
