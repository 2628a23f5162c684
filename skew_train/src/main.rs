use anyhow::Result;
use clap::Parser;
use tracing::metadata::LevelFilter;

use config::{Cli, Command};

mod config;
mod dataset;
mod training;

fn main() -> Result<()> {
    configure_logging();

    match parse_cli_args() {
        Command::Train(config) => {
            training::train(&config)?;
        }
        Command::JsonTrain(json_config) => {
            let config = config::load_json_config(&json_config.file_path)?;
            training::train(&config)?;
        }
        Command::Eval(config) => {
            training::evaluate(&config)?;
        }
    }

    Ok(())
}

fn configure_logging() {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_max_level(LevelFilter::INFO)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
    }
}

fn parse_cli_args() -> Command {
    Cli::parse().command()
}
