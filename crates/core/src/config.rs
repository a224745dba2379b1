use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}

// ── Scheduler config ──────────────────────────────────────────

/// Scheduler configuration, typically parsed from TOML and then
/// overridden from `COMMONS_*` environment variables.
///
/// Backend selection is deliberately absent: it is detected from the host
/// (see [`crate::probe`]), never chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wall-clock length of one tick in milliseconds (hosts driving their
    /// own ticks ignore this).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// First backoff step, in ticks, for a task whose region is unloaded.
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ticks: u64,
    /// Upper bound on a single backoff step, in ticks.
    #[serde(default = "default_retry_max")]
    pub retry_max_ticks: u64,
    /// Ticks a task may wait for its region before it fails with
    /// `region-unavailable`.
    #[serde(default = "default_region_ceiling")]
    pub region_ceiling_ticks: u64,
    /// Worker threads for off-tick (async) tasks. 0 = available parallelism.
    #[serde(default = "default_async_workers")]
    pub async_workers: usize,
}

fn default_tick_ms() -> u64 { 50 }
fn default_retry_initial() -> u64 { 1 }
fn default_retry_max() -> u64 { 20 }
fn default_region_ceiling() -> u64 { 200 }
fn default_async_workers() -> usize { 0 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            retry_initial_ticks: default_retry_initial(),
            retry_max_ticks: default_retry_max(),
            region_ceiling_ticks: default_region_ceiling(),
            async_workers: default_async_workers(),
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply env overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "loading scheduler config");
        Self::from_toml(&content)
    }

    /// Build config from defaults plus environment variables
    /// (call [`load_dotenv`] first).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse("COMMONS_TICK_MS")? {
            self.tick_ms = v;
        }
        if let Some(v) = env_parse("COMMONS_RETRY_INITIAL_TICKS")? {
            self.retry_initial_ticks = v;
        }
        if let Some(v) = env_parse("COMMONS_RETRY_MAX_TICKS")? {
            self.retry_max_ticks = v;
        }
        if let Some(v) = env_parse("COMMONS_REGION_CEILING_TICKS")? {
            self.region_ceiling_ticks = v;
        }
        if let Some(v) = env_parse("COMMONS_ASYNC_WORKERS")? {
            self.async_workers = v;
        }
        Ok(())
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be positive".into()));
        }
        if self.retry_initial_ticks == 0 {
            return Err(ConfigError::Invalid(
                "retry_initial_ticks must be positive".into(),
            ));
        }
        if self.retry_max_ticks < self.retry_initial_ticks {
            return Err(ConfigError::Invalid(format!(
                "retry_max_ticks ({}) is below retry_initial_ticks ({})",
                self.retry_max_ticks, self.retry_initial_ticks
            )));
        }
        Ok(())
    }

    /// Length of one tick as a [`Duration`].
    pub fn tick_length(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Resolve async worker count (0 means use available parallelism).
    pub fn resolved_async_workers(&self) -> usize {
        if self.async_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.async_workers
        }
    }
}
