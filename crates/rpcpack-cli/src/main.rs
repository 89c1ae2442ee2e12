//! rpcpack CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use rpcpack_cli::cli::{Cli, Command, ConfigAction};
use rpcpack_cli::commands;
use rpcpack_cli::config::CliConfig;
use rpcpack_cli::error::CliResult;
use rpcpack_cli::tracing::init_tracing;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<()> {
    // An explicit path must load; the default path may be absent.
    let config = if let Some(ref path) = cli.config {
        CliConfig::load_from(path)?
    } else {
        CliConfig::load()?
    };

    init_tracing(config.tracing(cli.debug))?;

    match cli.command {
        Command::Inspect { file, hex, summary } => {
            commands::inspect::run(file.as_deref(), hex, summary, &config)
        }
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
