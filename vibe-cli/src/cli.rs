use std::path::PathBuf;

use clap::Parser;

use crate::commands::Commands;

#[derive(Parser, Debug)]
#[clap(name = "vibe-cli")]
#[clap(
    about = "Derive fingerprints, compare profiles and simulate nearby nodes",
    long_about = None
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Debug, clap::Args)]
pub struct ConfigArgs {
    #[clap(
        long,
        value_parser,
        help = "Engine config file (defaults to the platform config directory)"
    )]
    pub config: Option<PathBuf>,

    #[clap(
        long,
        help = "Start from a preset instead: balanced, battery_saver or social"
    )]
    pub preset: Option<String>,
}
