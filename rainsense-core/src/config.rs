use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::{Path, PathBuf}, time::Duration};

use crate::decision::{SensorConfig, TargetKind, TriggerKind};
use crate::provider::ProviderId;

/// Configuration for a single provider (e.g., API key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
}

/// Where to monitor. Explicit coordinates win over an address; with neither
/// set the location is resolved automatically from the host's IP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationSettings {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
}

/// Daily window during which automatic output changes are suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    /// `HH:MM`, 24-hour local time.
    pub start: String,
    pub end: String,
}

/// Polling and chain timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Seconds between polling ticks; clamped to 60..=900 on validation.
    pub poll_interval_secs: u64,
    /// Budget for a single provider call.
    pub call_timeout_secs: u64,
    /// How long a chain response stays servable from cache.
    pub cache_ttl_secs: u64,
    /// Waits imposed after consecutive failed attempts, in order.
    pub backoff_schedule_secs: Vec<u64>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 180,
            call_timeout_secs: 10,
            cache_ttl_secs: 60,
            backoff_schedule_secs: vec![30, 60, 120, 300],
        }
    }
}

pub const MIN_POLL_INTERVAL_SECS: u64 = 60;
pub const MAX_POLL_INTERVAL_SECS: u64 = 900;

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Optional pinned provider id, e.g. "openweather"; absent means the
    /// full chain in default priority order.
    pub provider: Option<String>,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub location: LocationSettings,

    pub quiet_hours: Option<QuietHoursConfig>,

    /// Monitored outputs, evaluated in configuration order.
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SensorConfig>,
}

impl Config {
    /// Return the pinned provider as a strongly-typed ProviderId, if any.
    pub fn pinned_provider_id(&self) -> Result<Option<ProviderId>> {
        match self.provider.as_deref() {
            None => Ok(None),
            Some(s) => ProviderId::try_from(s).map(Some),
        }
    }

    pub fn provider_config(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(id.as_str())
    }

    /// Returns API key for a provider, if present.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers.get(provider_id.as_str()).map(|cfg| cfg.api_key.as_str())
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        self.provider_api_key(provider_id).is_some()
    }

    /// Convenience helper: set/replace a provider API key.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers.insert(provider_id.as_str().to_string(), ProviderConfig { api_key });
    }

    /// Clamp and default everything that has a legal range. Called after
    /// every load; keeps a hand-edited file from producing a pathological
    /// daemon (1-second polling, empty backoff schedule).
    pub fn normalize(&mut self) {
        self.daemon.poll_interval_secs = self
            .daemon
            .poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);

        if self.daemon.call_timeout_secs == 0 {
            self.daemon.call_timeout_secs = DaemonSettings::default().call_timeout_secs;
        }

        if self.daemon.backoff_schedule_secs.is_empty() {
            self.daemon.backoff_schedule_secs = DaemonSettings::default().backoff_schedule_secs;
        }

        if self.sensors.is_empty() {
            self.sensors.push(SensorConfig {
                name: "rain".to_string(),
                trigger: TriggerKind::Now,
                kind: TargetKind::Rain,
                ..SensorConfig::default()
            });
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.poll_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.call_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.daemon.cache_ttl_secs)
    }

    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.daemon.backoff_schedule_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    /// Load config from disk, or return defaults if the file doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    /// Load from an explicit path (`--config` override, tests).
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, return defaults.
            let mut cfg = Self::default();
            cfg.normalize();
            return Ok(cfg);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        cfg.normalize();
        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Platform data directory, used for the location cache.
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        Ok(dirs.data_dir().to_path_buf())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "rainsense", "rainsense")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderId;

    #[test]
    fn defaults_are_sane() {
        let mut cfg = Config::default();
        cfg.normalize();

        assert_eq!(cfg.daemon.poll_interval_secs, 180);
        assert_eq!(cfg.daemon.cache_ttl_secs, 60);
        assert_eq!(cfg.daemon.backoff_schedule_secs, vec![30, 60, 120, 300]);
        assert_eq!(cfg.sensors.len(), 1);
        assert_eq!(cfg.sensors[0].name, "rain");
    }

    #[test]
    fn poll_interval_is_clamped() {
        let mut cfg = Config::default();
        cfg.daemon.poll_interval_secs = 5;
        cfg.normalize();
        assert_eq!(cfg.daemon.poll_interval_secs, MIN_POLL_INTERVAL_SECS);

        cfg.daemon.poll_interval_secs = 86_400;
        cfg.normalize();
        assert_eq!(cfg.daemon.poll_interval_secs, MAX_POLL_INTERVAL_SECS);
    }

    #[test]
    fn empty_backoff_schedule_falls_back_to_default() {
        let mut cfg = Config::default();
        cfg.daemon.backoff_schedule_secs.clear();
        cfg.normalize();
        assert_eq!(cfg.daemon.backoff_schedule_secs, vec![30, 60, 120, 300]);
    }

    #[test]
    fn set_api_key_for_provider() {
        let mut cfg = Config::default();

        cfg.upsert_provider_api_key(ProviderId::OpenWeather, "OPEN_KEY".into());

        let key = cfg.provider_api_key(ProviderId::OpenWeather);
        assert_eq!(key, Some("OPEN_KEY"));
        assert!(cfg.is_provider_configured(ProviderId::OpenWeather));
        assert!(!cfg.is_provider_configured(ProviderId::WeatherApi));
    }

    #[test]
    fn pinned_provider_parses_or_errors() {
        let mut cfg = Config::default();
        assert!(cfg.pinned_provider_id().unwrap().is_none());

        cfg.provider = Some("weatherapi".into());
        assert_eq!(cfg.pinned_provider_id().unwrap(), Some(ProviderId::WeatherApi));

        cfg.provider = Some("doesnotexist".into());
        assert!(cfg.pinned_provider_id().is_err());
    }

    #[test]
    fn parses_full_toml_surface() {
        let toml = r#"
            provider = "openweather"

            [providers.openweather]
            api_key = "KEY"

            [daemon]
            poll_interval_secs = 120
            call_timeout_secs = 8
            cache_ttl_secs = 45
            backoff_schedule_secs = [10, 20]

            [location]
            address = "Berlin, Germany"

            [quiet_hours]
            start = "22:00"
            end = "06:00"

            [[sensor]]
            name = "rain"
            trigger = "now"
            kind = "rain"
            rate_threshold_mm_h = 0.05

            [[sensor]]
            name = "rain-soon"
            trigger = "soon"
            kind = "rain"
            lookahead_minutes = 45
        "#;

        let mut cfg: Config = toml::from_str(toml).expect("config should parse");
        cfg.normalize();

        assert_eq!(cfg.daemon.poll_interval_secs, 120);
        assert_eq!(cfg.location.address.as_deref(), Some("Berlin, Germany"));
        assert_eq!(cfg.sensors.len(), 2);
        assert_eq!(cfg.sensors[1].lookahead_minutes, 45);
        assert!(cfg.quiet_hours.is_some());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut cfg = Config::default();
        cfg.upsert_provider_api_key(ProviderId::WeatherApi, "WK".into());
        cfg.normalize();
        cfg.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.provider_api_key(ProviderId::WeatherApi), Some("WK"));
        assert_eq!(loaded.sensors.len(), 1);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_from(&dir.path().join("nope.toml")).expect("load");
        assert_eq!(cfg.daemon.poll_interval_secs, 180);
    }
}
