//! `tollgatectl`: operator CLI for Tollgate queues and rate limiters.

mod cli;
mod commands;
mod runtime;

use anyhow::Context;
use clap::Parser;
use tollgate_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.global.config.clone(),
        env_file: cli.global.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    if let Some(queue) = cli.global.queue.clone() {
        config.queue.name = queue;
    }
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    // Config inspection never needs a store connection.
    if let Command::Config(command) = &cli.command {
        return match command {
            ConfigCommand::Show => commands::config_show(&config),
            ConfigCommand::Check => commands::config_check(&config, &warnings, cli.global.json),
        };
    }

    let runtime = runtime::Runtime::connect(&config).await?;
    commands::dispatch(&runtime, cli.command, cli.global.json).await
}
