//! Configuration management for Cadence

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Where the token encryption key comes from.
///
/// The environment variable wins over the key file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_key_env")]
    pub key_env: String,
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            key_file: None,
        }
    }
}

fn default_key_env() -> String {
    "CADENCE_VAULT_KEY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_refresh_lookahead")]
    pub refresh_lookahead_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            lock_ttl_secs: default_lock_ttl(),
            refresh_lookahead_secs: default_refresh_lookahead(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SchedulingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_poll_interval() -> u64 {
    30
}
fn default_batch_size() -> u32 {
    50
}
fn default_max_workers() -> usize {
    8
}
fn default_lock_ttl() -> u64 {
    300
}
fn default_refresh_lookahead() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> u64 {
    30
}
fn default_max_delay() -> u64 {
    3600
}
fn default_rate_limit_cooldown() -> u64 {
    900
}
fn default_shutdown_grace() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_analytics_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_analytics_staleness")]
    pub staleness_secs: u64,
    #[serde(default = "default_analytics_batch")]
    pub batch_size: u32,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_analytics_interval(),
            staleness_secs: default_analytics_staleness(),
            batch_size: default_analytics_batch(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_analytics_interval() -> u64 {
    3600
}
fn default_analytics_staleness() -> u64 {
    6 * 3600
}
fn default_analytics_batch() -> u32 {
    100
}
fn default_cache_ttl() -> u64 {
    900
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsConfig {
    pub twitter: Option<OAuthClientConfig>,
    pub linkedin: Option<OAuthClientConfig>,
    pub mastodon: Option<MastodonConfig>,
}

/// OAuth application credentials for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonConfig {
    /// Instance base URL, e.g. "https://mastodon.social"
    pub instance: String,
    #[serde(flatten)]
    pub client: OAuthClientConfig,
}

fn default_request_timeout() -> u64 {
    30
}

impl PlatformsConfig {
    /// Longest request timeout across configured platforms
    pub fn max_request_timeout(&self) -> Duration {
        let secs = [
            self.twitter.as_ref().map(|c| c.request_timeout_secs),
            self.linkedin.as_ref().map(|c| c.request_timeout_secs),
            self.mastodon.as_ref().map(|c| c.client.request_timeout_secs),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or_else(default_request_timeout);
        Duration::from_secs(secs)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduling;

        if s.poll_interval_secs == 0 {
            return Err(invalid("scheduling.poll_interval_secs must be greater than 0"));
        }
        if s.batch_size == 0 {
            return Err(invalid("scheduling.batch_size must be greater than 0"));
        }
        if s.max_workers == 0 {
            return Err(invalid("scheduling.max_workers must be greater than 0"));
        }
        if s.max_attempts == 0 {
            return Err(invalid("scheduling.max_attempts must be greater than 0"));
        }
        if s.max_delay_secs < s.base_delay_secs {
            return Err(invalid(
                "scheduling.max_delay_secs must not be smaller than scheduling.base_delay_secs",
            ));
        }
        if s.lock_ttl() <= self.platforms.max_request_timeout() {
            return Err(invalid(&format!(
                "scheduling.lock_ttl_secs ({}) must exceed the longest platform request timeout ({}s)",
                s.lock_ttl_secs,
                self.platforms.max_request_timeout().as_secs()
            )));
        }
        if self.analytics.interval_secs == 0 {
            return Err(invalid("analytics.interval_secs must be greater than 0"));
        }

        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/cadence/cadence.db".to_string(),
            },
            vault: VaultConfig::default(),
            scheduling: SchedulingConfig::default(),
            analytics: AnalyticsConfig::default(),
            platforms: PlatformsConfig::default(),
        }
    }
}

fn invalid(message: &str) -> crate::error::CadenceError {
    ConfigError::Invalid(message.to_string()).into()
}

/// Resolve the configuration file path following XDG Base Directory conventions
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("cadence").join("config.toml"))
}
