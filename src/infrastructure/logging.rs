//! Logging system configuration and initialization
//!
//! - Console and/or file output, optional JSON for the file
//! - The previous log file is renamed with its timestamp on start-up
//! - Timestamps rendered at the schedule's fixed offset (KST by default)
//! - Verbose dependency targets capped unless the level is TRACE

#![allow(clippy::uninlined_format_args)]

use anyhow::{Result, anyhow};
use chrono::{FixedOffset, Utc};
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

// Keeps the non-blocking file writer alive for the process lifetime
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

type FilteredRegistry = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync + 'static>;

/// Wall-clock formatter at a fixed UTC offset
#[derive(Clone, Copy)]
struct OffsetTimeFormatter {
    offset: FixedOffset,
}

impl FormatTime for OffsetTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Utc::now().with_timezone(&self.offset);
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

fn fixed_offset(utc_offset_hours: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(utc_offset_hours * 3600)
        .ok_or_else(|| anyhow!("Invalid UTC offset: {} hours", utc_offset_hours))
}

/// Configured directory, or `logs/` next to the executable
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    if let Some(dir) = &config.log_dir {
        return dir.clone();
    }
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Rename the previous run's log file to `<stem>.<timestamp>.log`
fn rotate_existing_log_file(log_dir: &Path, log_file_name: &str, offset: FixedOffset) -> Result<()> {
    let log_file_path = log_dir.join(log_file_name);
    if !log_file_path.exists() {
        return Ok(());
    }

    let metadata = std::fs::metadata(&log_file_path)
        .map_err(|e| anyhow!("Failed to get log file metadata: {}", e))?;
    let file_time = metadata
        .modified()
        .or_else(|_| metadata.created())
        .unwrap_or_else(|_| std::time::SystemTime::now());
    let datetime: chrono::DateTime<Utc> = file_time.into();
    let local = datetime.with_timezone(&offset);

    let file_stem = log_file_name.trim_end_matches(".log");
    let timestamped_name = format!("{}.{}.log", file_stem, local.format("%Y%m%dT%H%M%S"));
    let timestamped_path = log_dir.join(&timestamped_name);

    std::fs::rename(&log_file_path, &timestamped_path).map_err(|e| {
        anyhow!(
            "Failed to rotate log file {} to {}: {}",
            log_file_path.display(),
            timestamped_path.display(),
            e
        )
    })?;
    Ok(())
}

/// Keep at most `max_files` rotated logs, newest first
fn cleanup_old_logs(log_dir: &Path, config: &LoggingConfig) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let stem = config.file_name.trim_end_matches(".log");
    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if filename == config.file_name || !filename.starts_with(stem) || !filename.ends_with(".log") {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            log_files.push((path, modified));
        }
    }

    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(config.max_files as usize) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove old log file {:?}: {}", path, e);
        } else {
            removed += 1;
        }
    }
    Ok(removed)
}

/// `RUST_LOG` wins; otherwise the configured level plus dependency caps
fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level '{}': {}", config.level, e))?;

    // TRACE shows everything, including SQL and HTTP internals
    if !config.level.to_lowercase().contains("trace") {
        for (target, level) in &config.module_filters {
            let directive = format!("{}={}", target, level)
                .parse()
                .map_err(|e| anyhow!("Invalid module filter {}={}: {}", target, level, e))?;
            filter = filter.add_directive(directive);
        }
        let own = format!("directory_sync_lib={}", config.level)
            .parse()
            .map_err(|e| anyhow!("Invalid log level '{}': {}", config.level, e))?;
        filter = filter.add_directive(own);
    }
    Ok(filter)
}

/// Initialize logging with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default(), crate::infrastructure::config::defaults::UTC_OFFSET_HOURS)
}

/// Initialize logging; fails if neither console nor file output is enabled
/// or if a global subscriber is already installed.
pub fn init_logging_with_config(config: &LoggingConfig, utc_offset_hours: i32) -> Result<()> {
    if !config.file_output && !config.console_output {
        return Err(anyhow!("No logging output configured"));
    }

    let timer = OffsetTimeFormatter {
        offset: fixed_offset(utc_offset_hours)?,
    };
    let env_filter = build_env_filter(config)?;
    let log_dir = get_log_directory(config);

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
        rotate_existing_log_file(&log_dir, &config.file_name, timer.offset)?;

        let (file_writer, file_guard) = non_blocking(rolling::never(&log_dir, &config.file_name));
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(file_guard);

        let file_layer = if config.json_format {
            fmt::Layer::new()
                .json()
                .with_writer(file_writer)
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .boxed()
        } else {
            // time + level + message only
            fmt::Layer::new()
                .with_writer(file_writer)
                .with_timer(timer)
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stdout)
                .with_timer(timer)
                .with_target(false)
                .boxed(),
        );
    }

    Registry::default()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("📝 Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log file: {:?}", log_dir.join(&config.file_name));
        match cleanup_old_logs(&log_dir, config) {
            Ok(0) => {}
            Ok(removed) => info!("🧹 Removed {} old log file(s)", removed),
            Err(e) => warn!("Log cleanup failed: {}", e),
        }
    }
    if !config.level.to_lowercase().contains("trace") {
        info!("SQL and verbose logs suppressed (use TRACE level to see all logs)");
    }

    Ok(())
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== directory-sync ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
    info!("======================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_directory_prefers_config() {
        let config = LoggingConfig {
            log_dir: Some(PathBuf::from("/var/log/directory-sync")),
            ..LoggingConfig::default()
        };
        assert_eq!(get_log_directory(&config), PathBuf::from("/var/log/directory-sync"));
        assert!(get_log_directory(&LoggingConfig::default()).ends_with("logs"));
    }

    #[test]
    fn test_rotation_renames_previous_log() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("sync.log"), "old run").unwrap();

        rotate_existing_log_file(dir.path(), "sync.log", fixed_offset(9).unwrap()).unwrap();

        assert!(!dir.path().join("sync.log").exists());
        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].starts_with("sync.") && rotated[0].ends_with(".log"));
    }

    #[test]
    fn test_cleanup_keeps_newest_rotated_files() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("sync.2026010{}T000000.log", i)), "x").unwrap();
        }
        std::fs::write(dir.path().join("sync.log"), "active").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let config = LoggingConfig {
            file_name: "sync.log".into(),
            max_files: 2,
            ..LoggingConfig::default()
        };
        assert_eq!(cleanup_old_logs(dir.path(), &config).unwrap(), 3);
        assert!(dir.path().join("sync.log").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_invalid_offset_is_rejected() {
        assert!(fixed_offset(9).is_ok());
        assert!(fixed_offset(30).is_err());
    }

    #[test]
    fn test_no_outputs_is_an_error() {
        let config = LoggingConfig {
            console_output: false,
            file_output: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging_with_config(&config, 9).is_err());
    }
}
