//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the Supabase project URL and anon key, the last used email, and session
//! and cache tuning.
//!
//! Configuration is stored at `~/.config/supadesk/config.json`.
//! `SUPABASE_URL` and `SUPABASE_ANON_KEY` in the environment take precedence.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::api::SupabaseEndpoint;
use crate::auth::SessionConfig;
use crate::cache::DEFAULT_STALE_MINUTES;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "supadesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_URL: &str = "SUPABASE_URL";
pub const ENV_ANON_KEY: &str = "SUPABASE_ANON_KEY";

const DEFAULT_REFRESH_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_anon_key: Option<String>,
    #[serde(default)]
    pub last_email: Option<String>,
    #[serde(default = "default_refresh_leeway_secs")]
    pub refresh_leeway_secs: i64,
    #[serde(default = "default_report_stale_minutes")]
    pub report_stale_minutes: i64,
}

fn default_refresh_leeway_secs() -> i64 {
    DEFAULT_REFRESH_LEEWAY_SECS
}

fn default_report_stale_minutes() -> i64 {
    DEFAULT_STALE_MINUTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            last_email: None,
            refresh_leeway_secs: DEFAULT_REFRESH_LEEWAY_SECS,
            report_stale_minutes: DEFAULT_STALE_MINUTES,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override project settings from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(std::env::var(ENV_URL).ok(), std::env::var(ENV_ANON_KEY).ok());
    }

    fn apply_overrides(&mut self, url: Option<String>, anon_key: Option<String>) {
        if let Some(url) = url.filter(|v| !v.trim().is_empty()) {
            self.supabase_url = Some(url);
        }
        if let Some(key) = anon_key.filter(|v| !v.trim().is_empty()) {
            self.supabase_anon_key = Some(key);
        }
    }

    pub fn endpoint(&self) -> Result<SupabaseEndpoint> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Supabase URL not configured (set {})", ENV_URL))?;
        let key = self
            .supabase_anon_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Supabase anon key not configured (set {})", ENV_ANON_KEY))?;

        if !(url.starts_with("https://") || url.starts_with("http://")) {
            anyhow::bail!("Supabase URL must start with http:// or https://: {}", url);
        }
        Ok(SupabaseEndpoint::new(url, key))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_leeway: Duration::seconds(self.refresh_leeway_secs.max(0)),
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir =
            dirs::cache_dir().ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
