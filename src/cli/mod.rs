// Command Line Interface Module
// clap front end for running and inspecting the medic

pub mod commands;

use clap::{Parser, Subcommand};
use colored::*;

/// Home Medic - self-healing supervisor for Home Assistant fleets
#[derive(Parser)]
#[command(name = "medic")]
#[command(author = "Home Medic Team")]
#[command(version)]
#[command(about = "Home Medic - detects unhealthy entities and heals their integrations", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the monitoring and healing loop for every configured instance
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "medic.toml")]
        config: String,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[arg(short, long, default_value = "medic.toml")]
        file: String,
    },

    /// Run integration discovery once and print the result
    Discover {
        #[arg(short, long, default_value = "medic.toml")]
        config: String,

        /// Instance id from the configuration
        #[arg(short, long)]
        instance: String,
    },

    /// Show recent healing actions and cascades from the store
    History {
        #[arg(short, long, default_value = "medic.toml")]
        config: String,

        #[arg(short, long)]
        instance: String,

        /// Number of rows per table
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}

/// Print a warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print the startup banner
pub fn print_banner() {
    println!("{}", format!(r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║   HOME MEDIC  v{:<10}                                  ║
║                                                           ║
║   Detects unhealthy entities and heals their              ║
║   integrations, one circuit breaker per target            ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
    "#, env!("CARGO_PKG_VERSION")).bright_cyan().bold());
}
