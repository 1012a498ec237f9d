use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "vodsearch",
    version,
    about = "Per-author semantic search service for archived stream chat"
)]
pub struct Args {
    /// Base directory for config, model cache and index data
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP service
    Daemon {
        /// Listen address, overrides the config value
        #[arg(long)]
        listen: Option<String>,
    },

    /// Print on-disk index status for one author
    Inspect { login: String },
}
