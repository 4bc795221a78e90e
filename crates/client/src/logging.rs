//! Tracing subscriber setup.
//!
//! Logs go to stderr unless `logging.file` is set, so stdout carries only
//! command output. `RUST_LOG` overrides the configured level.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Keeps the background log writer alive. Dropping it flushes pending lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Installs the global subscriber.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config, verbose)));

    let Some(path) = &config.file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;
        return Ok(LogGuard { _worker: None });
    };

    let (dir, file_name) = split_log_path(path)?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(&dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    Ok(LogGuard {
        _worker: Some(guard),
    })
}

fn filter_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        config.level.clone()
    }
}

fn split_log_path(path: &Path) -> Result<(PathBuf, OsString)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Log file path has no file name: {}", path.display()))?
        .to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_overrides_level() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            file: None,
        };
        assert_eq!(filter_directive(&config, false), "warn");
        assert_eq!(filter_directive(&config, true), "debug");
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/cmdproc/client.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/cmdproc"));
        assert_eq!(name, OsString::from("client.log"));

        let (dir, name) = split_log_path(Path::new("client.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, OsString::from("client.log"));
    }

    #[test]
    fn test_split_log_path_without_file_name() {
        assert!(split_log_path(Path::new("/")).is_err());
    }
}
