//! Configuration loading for the mirror
//!
//! Settings come from (lowest to highest priority):
//! 1. Built-in defaults
//! 2. JSON file (~/.config/mirror/mirror.json)
//! 3. Environment variables

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::BackoffPolicy;

/// Config filename in the mirror config directory
const CONFIG_FILE: &str = "mirror.json";

/// Database filename in the mirror data directory
const DB_FILE: &str = "mirror.sqlite";

/// Rate-limit retry settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub decay_base: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1000,
            decay_base: 2.0,
        }
    }
}

/// Settings for syncing a Square merchant into the local store
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// OAuth application id, sent as `client_id` on refresh
    pub application_id: Option<String>,
    /// OAuth application secret; absent for PKCE-issued credentials
    pub application_secret: Option<String>,
    pub token_url: Option<String>,
    pub api_base_url: Option<String>,
    /// Locations searched when listing orders
    pub location_ids: Vec<String>,
    pub page_size: usize,
    pub db_path: Option<PathBuf>,
    pub retry: RetrySettings,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            application_id: None,
            application_secret: None,
            token_url: None,
            api_base_url: None,
            location_ids: Vec::new(),
            page_size: 50,
            db_path: None,
            retry: RetrySettings::default(),
        }
    }
}

impl fmt::Debug for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorConfig")
            .field("application_id", &self.application_id)
            .field("has_application_secret", &self.application_secret.is_some())
            .field("token_url", &self.token_url)
            .field("api_base_url", &self.api_base_url)
            .field("location_ids", &self.location_ids)
            .field("page_size", &self.page_size)
            .field("db_path", &self.db_path)
            .field("retry", &self.retry)
            .finish()
    }
}

impl MirrorConfig {
    /// Load the config file if present, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut cfg = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific JSON file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut cfg: Self = config::load_json_file(path)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse from a JSON string, without environment overrides
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json).context("Failed to parse mirror config JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment variables
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Get the default config file path (~/.config/mirror/mirror.json)
    pub fn default_config_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = config::env_parse("SQUARE_APPLICATION_ID")? {
            self.application_id = Some(v);
        }
        if let Some(v) = config::env_parse("SQUARE_APPLICATION_SECRET")? {
            self.application_secret = Some(v);
        }
        if let Some(v) = config::env_parse("SQUARE_TOKEN_URL")? {
            self.token_url = Some(v);
        }
        if let Some(v) = config::env_parse("SQUARE_API_BASE_URL")? {
            self.api_base_url = Some(v);
        }
        if let Some(v) = config::env_parse::<String>("SQUARE_LOCATION_IDS")? {
            self.location_ids = v
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = config::env_parse("MIRROR_PAGE_SIZE")? {
            self.page_size = v;
        }
        if let Some(v) = config::env_parse("MIRROR_DB_PATH")? {
            self.db_path = Some(v);
        }
        if let Some(v) = config::env_parse("MIRROR_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = config::env_parse("MIRROR_INITIAL_DELAY_MS")? {
            self.retry.initial_delay_ms = v;
        }
        if let Some(v) = config::env_parse("MIRROR_DECAY_BASE")? {
            self.retry.decay_base = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            anyhow::bail!("page_size must be at least 1");
        }
        if !self.retry.decay_base.is_finite() || self.retry.decay_base < 1.0 {
            anyhow::bail!(
                "retry.decay_base must be a finite number >= 1, got {}",
                self.retry.decay_base
            );
        }
        Ok(())
    }

    /// Application id, required to refresh credentials
    pub fn application_id(&self) -> Result<&str> {
        self.application_id.as_deref().context(
            "No Square application id configured \
             (set SQUARE_APPLICATION_ID or application_id in mirror.json)",
        )
    }

    /// Database path, defaulting to the data directory
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => config::data_path(DB_FILE).context("Could not determine data directory"),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            decay_base: self.retry.decay_base,
        }
    }
}
