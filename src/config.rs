//! Process configuration, resolved once at startup from the environment.
//!
//! Mirrors the `PORT` environment lookup the binary already did, generalized
//! to every tunable the server exposes. Nothing here is re-read after
//! startup; a `Config` is built once in `main` and handed out behind an
//! `Arc`.

use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_ARCHIVE_DIR: &str = "/zims";
const DEFAULT_PORT: u16 = 8899;
const DEFAULT_RATE_LIMIT: u32 = 60;
const DEFAULT_AUTO_UPDATE_FREQ: &str = "weekly";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid auto_update_freq '{0}': must be one of daily, weekly, monthly")]
    InvalidAutoUpdateFreq(String),

    #[error("invalid {name}='{value}': {reason}")]
    InvalidValue { name: &'static str, value: String, reason: String },
}

/// Cadence for the background auto-update scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl UpdateFrequency {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(ConfigError::InvalidAutoUpdateFreq(other.to_string())),
        }
    }

    pub fn as_duration(self) -> std::time::Duration {
        let days = match self {
            Self::Daily => 1,
            Self::Weekly => 7,
            Self::Monthly => 30,
        };
        std::time::Duration::from_secs(days * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub archive_dir: PathBuf,
    pub data_dir: PathBuf,
    pub manage_enabled: bool,
    pub manage_password: Option<String>,
    pub auto_update: bool,
    pub auto_update_freq: UpdateFrequency,
    pub rate_limit: u32,
    pub port: u16,
}

impl Config {
    /// Loads configuration from the environment, applying the defaults and
    /// validation rules from the external interfaces table. Fails fast on a
    /// malformed value rather than silently substituting a default — an
    /// operator who sets `AUTO_UPDATE_FREQ=fortnightly` wants to know they
    /// typoed it, not to discover weeks later that it fell back to weekly.
    pub fn from_env() -> Result<Self, ConfigError> {
        let archive_dir = env_path("ARCHIVE_DIR", DEFAULT_ARCHIVE_DIR);
        let data_dir = match std::env::var("DATA_DIR") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => archive_dir.join(".zimi"),
        };
        let manage_enabled = env_bool("MANAGE_ENABLED", true)?;
        let manage_password = std::env::var("MANAGE_PASSWORD").ok().filter(|s| !s.is_empty());
        let auto_update = env_bool("AUTO_UPDATE", false)?;
        let auto_update_freq = match std::env::var("AUTO_UPDATE_FREQ") {
            Ok(v) if !v.is_empty() => UpdateFrequency::parse(&v)?,
            _ => UpdateFrequency::parse(DEFAULT_AUTO_UPDATE_FREQ).expect("default is valid"),
        };
        let rate_limit = env_u32("RATE_LIMIT", DEFAULT_RATE_LIMIT)?;
        let port = env_u16("PORT", DEFAULT_PORT)?;

        Ok(Self {
            archive_dir,
            data_dir,
            manage_enabled,
            manage_password,
            auto_update,
            auto_update_freq,
            rate_limit,
            port,
        })
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => PathBuf::from(default),
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name,
                value: v,
                reason: "expected a boolean (true/false/1/0)".into(),
            }),
        },
    }
}

fn env_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: v,
            reason: "expected a non-negative integer".into(),
        }),
    }
}

fn env_u16(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: v,
            reason: "expected a port number 0-65535".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_update_freq_rejects_unknown_values() {
        assert!(UpdateFrequency::parse("fortnightly").is_err());
        assert!(UpdateFrequency::parse("daily").is_ok());
        assert!(UpdateFrequency::parse("weekly").is_ok());
        assert!(UpdateFrequency::parse("monthly").is_ok());
    }

    #[test]
    fn update_frequency_durations_are_ordered() {
        assert!(UpdateFrequency::Daily.as_duration() < UpdateFrequency::Weekly.as_duration());
        assert!(UpdateFrequency::Weekly.as_duration() < UpdateFrequency::Monthly.as_duration());
    }
}
