use anyhow::Context;
use clap::Parser;
use serde_json::json;

mod cli;
mod config;
mod semantic;
mod web;

use config::Config;
use semantic::{SearchError, SearchService};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();
    let base_dir = args
        .base_dir
        .clone()
        .unwrap_or_else(config::default_base_dir);
    let config = Config::load_with(&base_dir);

    let service = SearchService::new(
        &config.semantic,
        config.emotion_anchors.clone(),
        config.base_path(),
    )
    .context("failed to set up search service")?;

    match args.command {
        cli::Command::Daemon { listen } => {
            let listen = listen.unwrap_or_else(|| config.listen.clone());
            web::start_daemon(service, listen, config.semantic.preload_model);
            Ok(())
        }

        cli::Command::Inspect { login } => {
            let report = match service.status(&login) {
                Ok(total) => json!({"login": login, "available": true, "total": total}),
                Err(SearchError::IndexUnavailable(_)) => {
                    json!({"login": login, "available": false})
                }
                Err(err) => return Err(err.into()),
            };
            println!("{}", serde_json::to_string_pretty(&report).unwrap());
            Ok(())
        }
    }
}
