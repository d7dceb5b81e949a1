use std::path::PathBuf;

use anyhow::{Context, Result};
use vibe_link::EngineConfig;

use crate::util::config_file;

#[derive(Clone, Debug, clap::Args)]
#[clap(
    name = "config",
    about = "Write a config file from a preset, or print the active one"
)]
pub struct Config {
    #[clap(long, help = "Preset to write: balanced, battery_saver or social")]
    preset: Option<String>,

    #[clap(long, value_parser, help = "Target file instead of the default location")]
    path: Option<PathBuf>,
}

impl Config {
    pub fn run(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => config_file()?,
        };
        match &self.preset {
            Some(preset) => {
                let config = EngineConfig::preset(preset)?;
                config
                    .save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote {} preset to {}", preset, path.display());
            }
            None => {
                let config = EngineConfig::load(&path)?;
                println!("# {}", path.display());
                print!("{}", config.to_toml_string()?);
            }
        }
        Ok(())
    }
}
