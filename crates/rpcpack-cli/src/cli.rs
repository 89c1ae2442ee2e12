//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// rpcpack - inspect MessagePack JSON-RPC messages
#[derive(Debug, Parser)]
#[command(name = "rpcpack")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "RPCPACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decode one encoded message and print it
    Inspect {
        /// File holding the message (reads stdin when omitted)
        file: Option<PathBuf>,

        /// Treat the input as hex text instead of raw bytes
        #[arg(long)]
        hex: bool,

        /// Print a one-line summary instead of the full message
        #[arg(long)]
        summary: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}
