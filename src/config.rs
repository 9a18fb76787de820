//! Configuration management for the upload server

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::upload::{
    SessionSettings, COMPLETED_RETENTION_SECS, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE,
    SESSION_EXPIRY_HOURS,
};

/// Longest accepted session TTL: one year
const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;

/// Longest accepted retention of finished sessions: 30 days
const MAX_COMPLETED_RETENTION_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Staging root for per-session chunk directories
    pub temp_dir: PathBuf,
    /// Final storage for merged files
    pub storage_dir: PathBuf,
    pub chunk_size: u64,
    pub max_file_size: u64,
    pub session_ttl_hours: i64,
    pub completed_retention_secs: i64,
    pub reaper_interval_secs: u64,
    pub verify_digest: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// SQLite URL for encoding job records; log-only notification when unset
    pub database_url: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            upload: UploadConfig {
                temp_dir: PathBuf::from("./data/tmp"),
                storage_dir: PathBuf::from("./data/storage"),
                chunk_size: DEFAULT_CHUNK_SIZE,
                max_file_size: DEFAULT_MAX_FILE_SIZE,
                session_ttl_hours: SESSION_EXPIRY_HOURS,
                completed_retention_secs: COMPLETED_RETENTION_SECS,
                reaper_interval_secs: 300,
                verify_digest: true,
            },
            jobs: JobsConfig {
                database_url: None,
                webhook_url: None,
                webhook_timeout_secs: 10,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from any variable source. Unset variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let chunk_size: u64 = parse_var(&lookup, "UPLOAD_CHUNK_SIZE", defaults.upload.chunk_size)?;
        ensure_range("UPLOAD_CHUNK_SIZE", chunk_size, 1, u64::MAX)?;

        let max_file_size: u64 =
            parse_var(&lookup, "UPLOAD_MAX_FILE_SIZE", defaults.upload.max_file_size)?;
        ensure_range("UPLOAD_MAX_FILE_SIZE", max_file_size, 1, u64::MAX)?;

        let session_ttl_hours: i64 = parse_var(
            &lookup,
            "UPLOAD_SESSION_TTL_HOURS",
            defaults.upload.session_ttl_hours,
        )?;
        ensure_range("UPLOAD_SESSION_TTL_HOURS", session_ttl_hours, 1, MAX_SESSION_TTL_HOURS)?;

        let completed_retention_secs: i64 = parse_var(
            &lookup,
            "UPLOAD_COMPLETED_RETENTION_SECS",
            defaults.upload.completed_retention_secs,
        )?;
        ensure_range(
            "UPLOAD_COMPLETED_RETENTION_SECS",
            completed_retention_secs,
            0,
            MAX_COMPLETED_RETENTION_SECS,
        )?;

        Ok(Config {
            server: ServerConfig {
                host: text("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var(&lookup, "SERVER_PORT", defaults.server.port)?,
            },
            upload: UploadConfig {
                temp_dir: text("UPLOAD_TEMP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.temp_dir),
                storage_dir: text("UPLOAD_STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.storage_dir),
                chunk_size,
                max_file_size,
                session_ttl_hours,
                completed_retention_secs,
                reaper_interval_secs: parse_var(
                    &lookup,
                    "UPLOAD_REAPER_INTERVAL_SECS",
                    defaults.upload.reaper_interval_secs,
                )?,
                verify_digest: parse_var(&lookup, "UPLOAD_VERIFY_DIGEST", defaults.upload.verify_digest)?,
            },
            jobs: JobsConfig {
                database_url: text("DATABASE_URL"),
                webhook_url: text("JOB_WEBHOOK_URL"),
                webhook_timeout_secs: parse_var(
                    &lookup,
                    "JOB_WEBHOOK_TIMEOUT_SECS",
                    defaults.jobs.webhook_timeout_secs,
                )?,
            },
        })
    }
}

impl UploadConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            chunk_size: self.chunk_size,
            max_file_size: self.max_file_size,
            session_ttl: chrono::Duration::hours(self.session_ttl_hours),
            completed_retention: chrono::Duration::seconds(self.completed_retention_secs),
            verify_digest: self.verify_digest,
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Create the staging and storage directories if they are missing
    pub async fn ensure_directories(&self) -> crate::error::Result<()> {
        for dir in [&self.temp_dir, &self.storage_dir] {
            create_if_missing(dir).await?;
        }
        Ok(())
    }
}

async fn create_if_missing(dir: &Path) -> std::io::Result<()> {
    if !tokio::fs::try_exists(dir).await? {
        tokio::fs::create_dir_all(dir).await?;
        tracing::info!(path = %dir.display(), "Created directory");
    }
    Ok(())
}

fn ensure_range<T>(name: &'static str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + ToString,
{
    if value < min || value > max {
        return Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        _ => Ok(default),
    }
}
