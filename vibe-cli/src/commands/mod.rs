use anyhow::Result;
use clap::Subcommand;

mod config;
mod fingerprint;
mod score;
mod simulate;

#[derive(Debug, Subcommand)]
pub enum Commands {
    Fingerprint(fingerprint::Fingerprint),
    Score(score::Score),
    Simulate(simulate::Simulate),
    Config(config::Config),
}

impl Commands {
    pub async fn run(&self) -> Result<()> {
        match self {
            Commands::Fingerprint(cmd) => cmd.run(),
            Commands::Score(cmd) => cmd.run(),
            Commands::Simulate(cmd) => cmd.run().await,
            Commands::Config(cmd) => cmd.run(),
        }
    }
}
