use clap::Parser;

mod cli;
mod commands;
mod util;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Cli::parse();
    if let Err(err) = args.command.run().await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
