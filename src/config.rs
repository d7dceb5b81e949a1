//! Engine configuration, persisted as TOML.
//!
//! Every section falls back to its defaults, so a config file only needs
//! the values it changes:
//!
//! ```toml
//! transports = ["lan"]
//!
//! [lifecycle]
//! max_concurrent_connections = 2
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::advertiser::AdvertisingConfig;
use crate::anonymizer::PrivacyConfig;
use crate::compatibility::AnalyzerConfig;
use crate::discovery::DiscoveryConfig;
use crate::errors::{Result, VibeError};
use crate::lifecycle::LifecycleConfig;
use crate::profile::InsightPolicy;
use crate::transport::{LanConfig, TransportKind};

/// Longest window or timeout any section accepts: one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Refuse `value` above `max`, naming the offending field.
pub(crate) fn ensure_at_most(field: &str, value: u64, max: u64) -> Result<()> {
    if value > max {
        return Err(VibeError::Config(format!(
            "{} must be at most {}, got {}",
            field, max, value
        )));
    }
    Ok(())
}

/// Seconds as a chrono duration, clamped to [`MAX_WINDOW_SECS`].
pub(crate) fn window_secs(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_WINDOW_SECS) as i64)
}

/// Milliseconds as a std duration, clamped to [`MAX_WINDOW_SECS`].
pub(crate) fn window_ms(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis.min(MAX_WINDOW_SECS * 1_000))
}

/// `at + window`, saturating at the latest representable instant.
pub(crate) fn saturating_add(
    at: DateTime<Utc>,
    window: chrono::Duration,
) -> DateTime<Utc> {
    at.checked_add_signed(window)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transports to probe at startup, in preference order.
    pub transports: Vec<TransportKind>,
    /// Whether discovery starts enabled. A persisted setting wins.
    pub discovery_enabled: bool,
    /// Directory for cooldowns, history and settings. Nothing is persisted
    /// when unset.
    pub storage_dir: Option<PathBuf>,
    pub privacy: PrivacyConfig,
    pub analyzer: AnalyzerConfig,
    pub lifecycle: LifecycleConfig,
    pub discovery: DiscoveryConfig,
    pub advertising: AdvertisingConfig,
    pub insights: InsightPolicy,
    pub lan: LanConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl EngineConfig {
    pub fn balanced() -> Self {
        Self {
            transports: vec![TransportKind::Ble, TransportKind::Lan],
            discovery_enabled: true,
            storage_dir: None,
            privacy: PrivacyConfig::default(),
            analyzer: AnalyzerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            discovery: DiscoveryConfig::default(),
            advertising: AdvertisingConfig::default(),
            insights: InsightPolicy::default(),
            lan: LanConfig::default(),
        }
    }

    /// Fewer, shorter connections and slower scanning.
    pub fn battery_saver() -> Self {
        let mut config = Self::balanced();
        config.lifecycle.max_concurrent_connections = 1;
        config.lifecycle.connect_interval_ms = 10_000;
        config.lifecycle.max_connection_duration_ms = 15_000;
        config.lifecycle.max_exchange_messages = 4;
        config.discovery.scan_tick_timeout_ms = 5_000;
        config.discovery.restart_backoff_ms = 5_000;
        config.lan.beacon_interval_ms = 5_000;
        config.privacy.fingerprint_ttl_secs = 600;
        config
    }

    /// More connections, shorter cooldowns, deeper sharing.
    pub fn social() -> Self {
        let mut config = Self::balanced();
        config.lifecycle.max_concurrent_connections = 5;
        config.lifecycle.cooldown_secs = 300;
        config.lifecycle.connect_interval_ms = 1_000;
        config.lifecycle.max_exchange_messages = 10;
        config.analyzer.compatibility_floor = 0.02;
        config
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "balanced" => Ok(Self::balanced()),
            "battery_saver" | "battery-saver" => Ok(Self::battery_saver()),
            "social" => Ok(Self::social()),
            other => Err(VibeError::Config(format!("unknown preset {}", other))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.privacy.validate()?;
        self.analyzer.validate()?;
        self.lifecycle.validate()?;
        self.discovery.validate()?;
        self.advertising
            .validate(self.privacy.fingerprint_ttl_secs)?;
        self.lan.validate()?;
        self.insights.validate()
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VibeError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        log::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            transports = ["memory"]

            [lifecycle]
            max_concurrent_connections = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.transports, vec![TransportKind::Memory]);
        assert_eq!(config.lifecycle.max_concurrent_connections, 2);
        assert_eq!(config.lifecycle.cooldown_secs, 600);
        assert_eq!(config.privacy.epsilon, 0.5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(EngineConfig::from_toml_str("[privacy]\nepsilon = -1.0").is_err());
        assert!(EngineConfig::from_toml_str(
            "[lifecycle]\nmax_concurrent_connections = 0"
        )
        .is_err());
        assert!(matches!(
            EngineConfig::from_toml_str("transports = 5"),
            Err(VibeError::Config(_))
        ));
    }

    #[test]
    fn oversized_windows_are_rejected() {
        for content in [
            "[lifecycle]\ncooldown_secs = 10000000000000",
            "[lifecycle]\nretry_cooldown_secs = 10000000000000",
            "[lifecycle]\nmax_connection_duration_ms = 10000000000000000",
            "[discovery]\nsilence_window_secs = 10000000000000",
            "[insights]\ndrift_window_secs = 10000000000000",
            "[privacy]\nsignature_rotation_secs = 10000000000000",
        ] {
            assert!(
                matches!(
                    EngineConfig::from_toml_str(content),
                    Err(VibeError::Config(_))
                ),
                "accepted {}",
                content
            );
        }
    }

    #[test]
    fn window_helpers_never_overflow() {
        assert_eq!(
            window_secs(u64::MAX),
            chrono::Duration::seconds(MAX_WINDOW_SECS as i64)
        );
        assert_eq!(
            saturating_add(DateTime::<Utc>::MAX_UTC, chrono::Duration::seconds(1)),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(
            window_ms(u64::MAX),
            std::time::Duration::from_secs(MAX_WINDOW_SECS)
        );
    }

    #[test]
    fn presets_are_valid() {
        for name in ["balanced", "battery_saver", "social"] {
            EngineConfig::preset(name).unwrap().validate().unwrap();
        }
        assert!(EngineConfig::preset("party").is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new("config").unwrap();
        let path = dir.path().join("vibe").join("config.toml");
        let mut config = EngineConfig::social();
        config.storage_dir = Some(dir.path().to_path_buf());
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = TempDir::new("config").unwrap();
        assert_eq!(
            EngineConfig::load(&dir.path().join("absent.toml")).unwrap(),
            EngineConfig::default()
        );
    }
}
