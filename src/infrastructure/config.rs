//! Configuration infrastructure
//!
//! Layering, lowest priority first:
//! 1. Built-in defaults (`defaults` module)
//! 2. Optional config file (`DIRECTORY_SYNC_CONFIG` or `<config_dir>/directory-sync/directory-sync.toml`)
//! 3. Environment variables, e.g. `DIRECTORY_SYNC__DIRECTORY__BASE_URL`

#![allow(clippy::uninlined_format_args)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::infrastructure::retry_policy::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub directory: DirectoryConfig,
    pub retry: RetryPolicy,
    pub sync: SyncConfig,
    pub schedule: ScheduleConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialHeader {
    pub header: String,
    pub value: String,
}

/// Directory service endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub base_url: String,
    /// Static header credentials sent on every request.
    pub credentials: Vec<CredentialHeader>,
    pub user_agent: String,
    /// `length` requested per page.
    pub page_length: u64,
}

/// Reconciliation behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Concurrent page fetches per listing.
    pub page_concurrency: usize,
    /// Concurrent per-institution attachment fetches.
    pub attachment_concurrency: usize,
    /// System account the user sync never deletes.
    pub reserved_username: String,
    /// Local group that receives the external-assessor cohort.
    pub external_group_code: Option<String>,
    /// Pool assigned to groups created by the group sync.
    pub default_pool_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntryConfig {
    /// "groups", "users" or "institutions".
    pub job: String,
    /// Local wall-clock time, "HH:MM".
    pub at: String,
    /// Institution levels, only for "institutions".
    #[serde(default)]
    pub levels: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Fixed offset of the wall clock the entries are written in.
    pub utc_offset_hours: i32,
    pub run_on_startup: bool,
    pub entries: Vec<ScheduleEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Defaults to `logs/` next to the executable.
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
    /// Rotated log files kept next to the active one.
    pub max_files: u32,
    /// Module-specific log level filters (e.g., "sqlx": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::DIRECTORY_BASE_URL.to_string(),
            credentials: Vec::new(),
            user_agent: defaults::USER_AGENT.to_string(),
            page_length: defaults::PAGE_LENGTH,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_concurrency: defaults::PAGE_CONCURRENCY,
            attachment_concurrency: defaults::ATTACHMENT_CONCURRENCY,
            reserved_username: defaults::RESERVED_USERNAME.to_string(),
            external_group_code: None,
            default_pool_id: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let entry = |job: &str, at: &str, levels: Vec<i64>| ScheduleEntryConfig {
            job: job.to_string(),
            at: at.to_string(),
            levels,
        };
        Self {
            utc_offset_hours: defaults::UTC_OFFSET_HOURS,
            run_on_startup: true,
            entries: vec![
                entry("groups", "01:00", Vec::new()),
                entry("users", "01:30", Vec::new()),
                entry("institutions", "02:00", vec![1]),
                entry("institutions", "03:00", vec![2, 3, 4, 5, 6]),
            ],
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let url = ConfigManager::get_app_data_dir().map_or_else(
            || format!("sqlite:{}?mode=rwc", defaults::DATABASE_FILE),
            |dir| format!("sqlite:{}?mode=rwc", dir.join(defaults::DATABASE_FILE).display()),
        );
        Self {
            url,
            max_connections: defaults::DB_MAX_CONNECTIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            max_files: defaults::LOG_MAX_FILES,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters
            },
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::Validation { message });

        if self.directory.base_url.trim().is_empty() {
            return fail("directory.base_url must not be empty".into());
        }
        if self.directory.page_length == 0 {
            return fail("directory.page_length must be greater than 0".into());
        }
        if let Some(c) = self.directory.credentials.iter().find(|c| c.header.trim().is_empty()) {
            return fail(format!("credential header name is empty (value length {})", c.value.len()));
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if self.sync.page_concurrency == 0 || self.sync.attachment_concurrency == 0 {
            return fail("sync concurrency limits must be at least 1".into());
        }
        if !(-12..=14).contains(&self.schedule.utc_offset_hours) {
            return fail(format!("schedule.utc_offset_hours out of range: {}", self.schedule.utc_offset_hours));
        }
        for entry in &self.schedule.entries {
            parse_time_of_day(&entry.at)?;
            match entry.job.as_str() {
                "groups" | "users" => {}
                "institutions" => {
                    if entry.levels.is_empty() {
                        return fail(format!("institutions entry at {} has no levels", entry.at));
                    }
                    if let Some(level) = entry.levels.iter().find(|l| !(1..=6).contains(*l)) {
                        return fail(format!("institution level {} is outside 1..=6", level));
                    }
                }
                other => return fail(format!("unknown schedule job '{}'", other)),
            }
        }
        Ok(())
    }
}

pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| ConfigError::Validation {
        message: format!("invalid time of day '{}': {}", raw, e),
    })
}

/// Configuration manager for locating and loading settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    pub fn get_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(defaults::APP_DIR_NAME))
    }

    pub fn get_app_data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(defaults::APP_DIR_NAME))
    }

    /// `DIRECTORY_SYNC_CONFIG` wins over the per-user config directory.
    pub fn new() -> Self {
        let config_path = std::env::var_os(defaults::CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .or_else(|| Self::get_config_dir().map(|dir| dir.join(defaults::CONFIG_FILE_NAME)))
            .unwrap_or_else(|| PathBuf::from(defaults::CONFIG_FILE_NAME));
        Self { config_path }
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
        }
    }

    /// Defaults, then the file (if present), then environment overrides.
    pub fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let app_config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::from(self.config_path.as_path()).required(false))
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        app_config.validate()?;
        info!("Loaded configuration (file: {:?})", self.config_path);
        Ok(app_config)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "directory-sync";
    pub const CONFIG_FILE_NAME: &str = "directory-sync.toml";
    pub const CONFIG_PATH_ENV: &str = "DIRECTORY_SYNC_CONFIG";
    pub const ENV_PREFIX: &str = "DIRECTORY_SYNC";

    pub const DIRECTORY_BASE_URL: &str = "http://localhost:8080/api/";
    pub const USER_AGENT: &str = "directory-sync/0.3";

    /// Default page length for paged listings
    pub const PAGE_LENGTH: u64 = 100;

    /// Page fan-out toward the directory
    pub const PAGE_CONCURRENCY: usize = 3;

    /// Per-institution attachment fetches
    pub const ATTACHMENT_CONCURRENCY: usize = 5;

    pub const RESERVED_USERNAME: &str = "admin";

    /// KST (UTC+9)
    pub const UTC_OFFSET_HOURS: i32 = 9;

    pub const DATABASE_FILE: &str = "directory-sync.db";
    pub const DB_MAX_CONNECTIONS: u32 = 5;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "directory-sync.log";
    pub const LOG_MAX_FILES: u32 = 10;
}
