use anyhow::{Context, Result};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParataskConfig {
    pub default_timeout_secs: u64,
    pub poll_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub thread_name_prefix: String,
    pub log_level: Option<String>,
}

impl Default for ParataskConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            poll_timeout_secs: 60,
            poll_interval_ms: 1000,
            thread_name_prefix: "paratask".to_string(),
            log_level: Some("info".to_string()),
        }
    }
}

impl ParataskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("poll_interval_ms must be greater than 0"));
        }

        if self.thread_name_prefix.is_empty() {
            return Err(anyhow::anyhow!("thread_name_prefix must not be empty"));
        }

        if self.thread_name_prefix.contains('\0') {
            return Err(anyhow::anyhow!(
                "thread_name_prefix must not contain NUL bytes"
            ));
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(&timeout) = matches.try_get_one::<u64>("timeout").ok().flatten() {
            self.default_timeout_secs = timeout;
            self.poll_timeout_secs = timeout;
        }

        if let Some(&interval) = matches.try_get_one::<u64>("interval").ok().flatten() {
            self.poll_interval_ms = interval;
        }

        if let Some(log_level) = matches.try_get_one::<String>("log-level").ok().flatten() {
            self.log_level = Some(log_level.clone());
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(timeout_str) = std::env::var("PARATASK_DEFAULT_TIMEOUT") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                self.default_timeout_secs = timeout;
            }
        }

        if let Ok(timeout_str) = std::env::var("PARATASK_POLL_TIMEOUT") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                self.poll_timeout_secs = timeout;
            }
        }

        if let Ok(interval_str) = std::env::var("PARATASK_POLL_INTERVAL_MS") {
            if let Ok(interval) = interval_str.parse::<u64>() {
                self.poll_interval_ms = interval;
            }
        }

        if let Ok(prefix) = std::env::var("PARATASK_THREAD_PREFIX") {
            self.thread_name_prefix = prefix;
        }

        if let Ok(log_level) = std::env::var("PARATASK_LOG_LEVEL") {
            self.log_level = Some(log_level);
        }
    }
}

/// Read a config file, falling back to defaults when the path does not exist
pub fn load_config_file(path: &str) -> Result<ParataskConfig> {
    if !Path::new(path).exists() {
        log::info!("Config file not found: {path}, using defaults");
        return Ok(ParataskConfig::default());
    }

    let file_content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file: {path}"))?;

    let config: ParataskConfig = toml::from_str(&file_content)
        .with_context(|| format!("Failed to parse config file: {path}"))?;

    log::info!("Loaded configuration from file: {path}");
    Ok(config)
}

/// Load configuration: CLI args > env vars > config file > defaults
pub fn load_config(config_path: Option<&str>, matches: &ArgMatches) -> Result<ParataskConfig> {
    let mut config = match config_path {
        Some(path) => load_config_file(path)?,
        None => ParataskConfig::default(),
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(matches);

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    log::debug!("Final config: {config:?}");

    Ok(config)
}

/// Create a sample configuration file
pub fn create_sample_config(path: &str) -> Result<()> {
    let config = ParataskConfig::default();
    let toml_content =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {path}"))?;

    Ok(())
}
