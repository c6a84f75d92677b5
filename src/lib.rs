pub mod cli;
pub mod config;
pub mod navigator;
pub mod path_format;
pub mod remote;
pub mod tags;

use anyhow::Result;
use clap::Parser;

/// Library entrypoint: parse the command line and run it.
pub async fn run() -> Result<()> {
    cli::execute(cli::Cli::parse()).await
}
