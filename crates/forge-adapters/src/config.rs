//! Configuration management for forge
//!
//! Stores settings in ~/.config/forge/config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Environment variables consulted for the API key, in priority order.
pub const API_KEY_VARS: [&str; 3] = ["FORGE_API_KEY", "OPENROUTER_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            attempt_timeout_ms: 60_000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    pub endpoint: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry: RetrySettings,
    /// Rules/history file; `None` means `<config_dir>/forge/rules.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            retry: RetrySettings::default(),
            rules_path: None,
        }
    }
}

impl Config {
    fn sanitize(&mut self) {
        let defaults = Config::default();
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = defaults.model;
        }
        self.endpoint = self.endpoint.trim().to_string();
        if self.endpoint.is_empty() {
            self.endpoint = defaults.endpoint;
        }
        if self.max_tokens == 0 {
            self.max_tokens = defaults.max_tokens;
        }
        if !self.temperature.is_finite() {
            self.temperature = defaults.temperature;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        if self.retry.attempt_timeout_ms == 0 {
            self.retry.attempt_timeout_ms = defaults.retry.attempt_timeout_ms;
        }
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("forge"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from the default location, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load config from `path`, or return defaults.
    ///
    /// A file that fails to parse is moved aside to `config.json.corrupt`.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Config>(&content) {
            Ok(mut config) => {
                config.sanitize();
                config
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Apply `FORGE_MODEL` / `FORGE_ENDPOINT` through the given lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("FORGE_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = model;
        }
        if let Some(endpoint) = lookup("FORGE_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            self.endpoint = endpoint;
        }
        self.sanitize();
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().context("Could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut sanitized = self.clone();
        sanitized.sanitize();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    warn!(error = %e, "failed to set config directory permissions");
                }
            }
        }

        let content =
            serde_json::to_string_pretty(&sanitized).context("Failed to serialize config")?;
        write_atomic(path, &content).context("Failed to write config")?;
        Ok(())
    }

    /// First non-empty key from [`API_KEY_VARS`].
    pub fn api_key(&self) -> Option<String> {
        Self::api_key_from(|key| std::env::var(key).ok())
    }

    pub fn api_key_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        API_KEY_VARS
            .iter()
            .filter_map(|var| lookup(var))
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key().is_some()
    }

    /// Where the rules/history file lives.
    pub fn rules_location(&self) -> Option<PathBuf> {
        self.rules_path
            .clone()
            .or_else(|| Self::config_dir().map(|dir| dir.join("rules.json")))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/forge/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

/// Write through a sibling temp file and rename it into place.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
