use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub themes_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_themes_dir: Option<PathBuf>,
    /// Reload on stylesheet edits. A `WATCH` file in `themes_dir` turns this on too.
    pub watch: bool,
    pub primary_tab: String,
    pub watchdog_interval_secs: u64,
    pub debounce_secs: u64,
    /// Back-off between marker injection attempts.
    pub time_unit_ms: u64,
    pub startup_marker_attempts: u32,
    pub watchdog_marker_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 58422,
            themes_dir: home_dir().join("homebrew").join("themes"),
            default_themes_dir: None,
            watch: false,
            primary_tab: "SP".to_string(),
            watchdog_interval_secs: 3,
            debounce_secs: 5,
            time_unit_ms: 1000,
            startup_marker_attempts: 9999,
            watchdog_marker_attempts: 3,
            request_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn should_watch(&self) -> bool {
        self.watch || self.themes_dir.join("WATCH").exists()
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn get_config_dir() -> Result<PathBuf> {
    let path = home_dir().join(".cssloader");
    if !path.exists() {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}

/// Loads `path`, writing the defaults there first if it does not exist yet.
/// A file that fails to parse is reported and replaced by defaults in memory.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Error parsing config. Using defaults.");
            Config::default()
        }))
    } else {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(config)
    }
}

pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_dir()?.join("config.toml"))
}
