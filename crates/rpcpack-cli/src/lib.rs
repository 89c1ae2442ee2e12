//! Command-line diagnostics for rpcpack
//!
//! This crate provides the `rpcpack` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod tracing;

pub use cli::Cli;
pub use error::{CliError, CliResult};
