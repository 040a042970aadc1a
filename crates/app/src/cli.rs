use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::{
    config::{DemoArgs, DemoConfig, ServeArgs, ServeConfig},
    demo, server,
};

#[derive(Debug, Parser)]
#[command(name = "relocate", version, about = "Geolocation spoofing daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the background store and the control API.
    Serve(ServeArgs),
    /// Run the background with a few simulated pages that print what they see.
    Demo(DemoArgs),
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => server::run(ServeConfig::try_from(args)?),
        Command::Demo(args) => demo::run(DemoConfig::try_from(args)?),
    }
}
