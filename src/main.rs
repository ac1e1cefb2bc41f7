//! Orca CLI entry point.

use clap::Parser;

use orca::cli::commands::{add, start, status};
use orca::cli::{Cli, Commands};
use orca::infrastructure::config::ConfigLoader;
use orca::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigLoader::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = LoggerImpl::init(&LogConfig::default()) {
        eprintln!("failed to initialize logger: {err}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Start => start::handle_start(config).await,
        Commands::Add { issue_id } => add::handle_add(config, issue_id, cli.json).await,
        Commands::Status => status::handle_status(config, cli.json).await,
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "orca exited with an error");
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}
