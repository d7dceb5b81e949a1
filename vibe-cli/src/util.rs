use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use vibe_link::{EngineConfig, PersonalityProfile};

use crate::cli::ConfigArgs;

const APP_DIR: &str = "vibe-link";

/// Platform config directory of the CLI.
///
/// - Linux: $XDG_CONFIG_HOME/vibe-link or $HOME/.config/vibe-link
/// - macOS: $HOME/Library/Application Support/vibe-link
/// - Windows: %APPDATA%\vibe-link
pub fn config_dir() -> Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = env::var("APPDATA") {
            return Ok(PathBuf::from(appdata).join(APP_DIR));
        }
        return Err(anyhow!(
            "Unable to determine config directory (missing APPDATA)"
        ));
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = env::var("HOME") {
            return Ok(PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join(APP_DIR));
        }
        return Err(anyhow!(
            "Unable to determine config directory (missing HOME)"
        ));
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let config_dir = if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME")
        {
            PathBuf::from(xdg_config_home)
        } else if let Ok(home) = env::var("HOME") {
            PathBuf::from(home).join(".config")
        } else {
            return Err(anyhow!(
                "Unable to determine config directory (missing XDG_CONFIG_HOME/HOME)"
            ));
        };
        Ok(config_dir.join(APP_DIR))
    }
}

pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve the engine config: a preset wins over a file, a missing file
/// means defaults.
pub fn load_config(args: &ConfigArgs) -> Result<EngineConfig> {
    if let Some(preset) = &args.preset {
        return EngineConfig::preset(preset)
            .with_context(|| format!("Failed to select preset {}", preset));
    }
    let path = match &args.config {
        Some(path) => path.clone(),
        None => config_file()?,
    };
    EngineConfig::load(&path)
        .with_context(|| format!("Failed to load config {}", path.display()))
}

pub fn read_profile(path: &Path) -> Result<PersonalityProfile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    let profile: PersonalityProfile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse profile {}", path.display()))?;
    profile
        .validate()
        .with_context(|| format!("Invalid profile {}", path.display()))?;
    Ok(profile)
}
