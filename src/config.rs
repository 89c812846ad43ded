//! Environment-driven agent configuration, resolved once at startup.

use std::path::PathBuf;
use std::time::Duration;

pub const ENV_CHECK_INTERVAL: &str = "RELAY_CHECK_INTERVAL";
pub const ENV_ENABLE_LABEL: &str = "RELAY_ENABLE_LABEL";
pub const ENV_CLEANUP_IMAGES: &str = "RELAY_CLEANUP_IMAGES";
pub const ENV_DOCKER_HOST: &str = "RELAY_DOCKER_HOST";
pub const ENV_DOCKER_TIMEOUT: &str = "RELAY_DOCKER_TIMEOUT";
pub const ENV_CHECK_ON_STARTUP: &str = "RELAY_CHECK_ON_STARTUP";
pub const ENV_DOCKER_CONFIG: &str = "RELAY_DOCKER_CONFIG";
pub const ENV_ROLLING_UPDATE: &str = "RELAY_ROLLING_UPDATE";
pub const ENV_HEALTHCHECK_TIMEOUT: &str = "RELAY_HEALTHCHECK_TIMEOUT";
pub const ENV_HEALTHCHECK_INTERVAL: &str = "RELAY_HEALTHCHECK_INTERVAL";

pub const DEFAULT_ENABLE_LABEL: &str = "relay.enable";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{variable} must be a positive integer, got '{value}'")]
    InvalidInteger {
        variable: &'static str,
        value: String,
    },
    #[error("{variable} must be a boolean (true/false/1/0), got '{value}'")]
    InvalidBool {
        variable: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub check_interval: Duration,
    pub enable_label: String,
    pub cleanup_images: bool,
    /// `None` means the platform's default local socket.
    pub engine_host: Option<String>,
    pub engine_timeout: Duration,
    pub check_on_startup: bool,
    /// `None` means auto-detect the engine config file.
    pub engine_config_path: Option<PathBuf>,
    pub rolling_update: bool,
    pub healthcheck_timeout: Duration,
    pub healthcheck_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            enable_label: DEFAULT_ENABLE_LABEL.to_string(),
            cleanup_images: false,
            engine_host: None,
            engine_timeout: Duration::from_secs(60),
            check_on_startup: true,
            engine_config_path: None,
            rolling_update: true,
            healthcheck_timeout: Duration::from_secs(60),
            healthcheck_interval: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            check_interval: positive_secs(&lookup, ENV_CHECK_INTERVAL, defaults.check_interval)?,
            enable_label: lookup(ENV_ENABLE_LABEL)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.enable_label),
            cleanup_images: boolean(&lookup, ENV_CLEANUP_IMAGES, defaults.cleanup_images)?,
            engine_host: lookup(ENV_DOCKER_HOST).filter(|v| !v.trim().is_empty()),
            engine_timeout: positive_secs(&lookup, ENV_DOCKER_TIMEOUT, defaults.engine_timeout)?,
            check_on_startup: boolean(&lookup, ENV_CHECK_ON_STARTUP, defaults.check_on_startup)?,
            engine_config_path: lookup(ENV_DOCKER_CONFIG)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            rolling_update: boolean(&lookup, ENV_ROLLING_UPDATE, defaults.rolling_update)?,
            healthcheck_timeout: positive_secs(
                &lookup,
                ENV_HEALTHCHECK_TIMEOUT,
                defaults.healthcheck_timeout,
            )?,
            healthcheck_interval: positive_secs(
                &lookup,
                ENV_HEALTHCHECK_INTERVAL,
                defaults.healthcheck_interval,
            )?,
        })
    }
}

fn positive_secs<F>(
    lookup: &F,
    variable: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(variable) else {
        return Ok(default);
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidInteger { variable, value }),
    }
}

fn boolean<F>(lookup: &F, variable: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(variable) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool { variable, value }),
    }
}
