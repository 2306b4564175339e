/// Application configuration management
/// Stores service settings in ~/.config/vackup/config.toml

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::constants::{
    DEFAULT_DOCKER_BINARY, DEFAULT_EVENTS_BACKOFF_INITIAL, DEFAULT_EVENTS_BACKOFF_MAX,
    DEFAULT_HELPER_IMAGE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SIZE_CONCURRENCY,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Container runtime CLI to invoke
    pub docker_binary: String,
    /// Image used for disposable helper containers
    pub helper_image: String,
    pub host: String,
    pub port: u16,
    /// Upper bound for a single runtime invocation, e.g. "30m". Unset = no limit
    pub operation_timeout: Option<String>,
    /// How many volumes are measured at once when listing with sizes
    pub size_concurrency: usize,
    pub events_backoff_initial: String,
    pub events_backoff_max: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            docker_binary: DEFAULT_DOCKER_BINARY.to_string(),
            helper_image: DEFAULT_HELPER_IMAGE.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            operation_timeout: None,
            size_concurrency: DEFAULT_SIZE_CONCURRENCY,
            events_backoff_initial: DEFAULT_EVENTS_BACKOFF_INITIAL.to_string(),
            events_backoff_max: DEFAULT_EVENTS_BACKOFF_MAX.to_string(),
        }
    }
}

impl AppConfig {
    /// Get config file path ($VACKUP_CONFIG wins over the platform config dir)
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("VACKUP_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("vackup");

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a file, falling back to defaults when it is absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Check values that would otherwise only fail once the service is running
    pub fn validate(&self) -> Result<()> {
        if self.docker_binary.trim().is_empty() {
            return Err(anyhow!("docker_binary must not be empty"));
        }
        if self.helper_image.trim().is_empty() {
            return Err(anyhow!("helper_image must not be empty"));
        }
        if self.size_concurrency == 0 {
            return Err(anyhow!("size_concurrency must be at least 1"));
        }
        self.timeout()?;
        let (initial, max) = self.events_backoff()?;
        if initial > max {
            return Err(anyhow!(
                "events_backoff_initial ({}) exceeds events_backoff_max ({})",
                self.events_backoff_initial,
                self.events_backoff_max
            ));
        }
        Ok(())
    }

    /// Parsed operation timeout
    pub fn timeout(&self) -> Result<Option<Duration>> {
        match self.operation_timeout.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => humantime::parse_duration(value)
                .map(Some)
                .with_context(|| format!("Invalid operation_timeout '{}'", value)),
        }
    }

    /// Parsed reconnect backoff bounds for the event watcher
    pub fn events_backoff(&self) -> Result<(Duration, Duration)> {
        let initial = humantime::parse_duration(&self.events_backoff_initial)
            .with_context(|| format!("Invalid events_backoff_initial '{}'", self.events_backoff_initial))?;
        let max = humantime::parse_duration(&self.events_backoff_max)
            .with_context(|| format!("Invalid events_backoff_max '{}'", self.events_backoff_max))?;
        Ok((initial, max))
    }
}
