use crate::config::{LogLevel, LoggingConfig};
use crate::paths::AppDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "cadenza.log";
const ENGINE_TARGET: &str = "cadenza_http";

/// Flushes buffered file output when dropped; hold it for the life of the process.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG`, when set, replaces the configured directives entirely.
pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives = filter_directives(config);
            EnvFilter::try_new(&directives)
                .map_err(|source| LoggingError::ParseLevel { directives, source })?
        }
    };

    let mut file_guard = None;
    let writer = match (config.console, config.file) {
        (console, true) => {
            let (file, guard) = open_log_file(config, dirs.log_dir())?;
            file_guard = Some(guard);
            if console {
                BoxMakeWriter::new(std::io::stderr.and(file))
            } else {
                BoxMakeWriter::new(file)
            }
        }
        // with every sink disabled, stderr still receives output
        (_, false) => BoxMakeWriter::new(std::io::stderr),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::SubscriberInstall)?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = config.level.as_filter_directive().to_string();
    if let Some(engine) = config.engine_level.filter(|level| *level != config.level) {
        directives.push_str(&format!(",{ENGINE_TARGET}={}", engine.as_filter_directive()));
    }
    directives
}

fn open_log_file(
    config: &LoggingConfig,
    log_dir: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDirectory {
        path: log_dir.to_path_buf(),
        source,
    })?;
    let file_name = config.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE);
    prune_rotated_logs(log_dir, file_name, config.max_log_files.max(1))?;

    let appender = tracing_appender::rolling::daily(log_dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Deletes the oldest rotated files named `file_name*` until at most `keep`
/// remain. Returns how many were removed.
fn prune_rotated_logs(dir: &Path, file_name: &str, keep: usize) -> Result<usize, LoggingError> {
    let listing = fs::read_dir(dir).map_err(|source| LoggingError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut rotated = Vec::new();
    for entry in listing.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(file_name) {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) {
            rotated.push((modified, entry.path()));
        }
    }
    if rotated.len() <= keep {
        return Ok(0);
    }

    // newest first; everything past `keep` goes
    rotated.sort_by(|left, right| right.0.cmp(&left.0));
    let stale = rotated.split_off(keep);
    for (_, path) in &stale {
        fs::remove_file(path).map_err(|source| LoggingError::Cleanup {
            path: path.clone(),
            source,
        })?;
    }
    Ok(stale.len())
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter {directives:?}: {source}")]
    ParseLevel {
        directives: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("a global tracing subscriber is already installed: {0}")]
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to list log directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove rotated log {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_level_adds_a_target_directive() {
        let mut config = LoggingConfig::default();
        assert_eq!(filter_directives(&config), "info");

        config.engine_level = Some(LogLevel::Debug);
        assert_eq!(filter_directives(&config), "info,cadenza_http=debug");

        config.engine_level = Some(LogLevel::Info);
        assert_eq!(filter_directives(&config), "info");
    }

    #[test]
    fn pruning_keeps_the_newest_rotations() {
        let dir = tempfile::tempdir().expect("tempdir");
        for day in 1..=4 {
            fs::write(dir.path().join(format!("cadenza.log.2026-01-0{day}")), b"line")
                .expect("write log");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        fs::write(dir.path().join("notes.txt"), b"keep").expect("write other");

        let removed = prune_rotated_logs(dir.path(), "cadenza.log", 2).expect("prune");
        assert_eq!(removed, 2);

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .expect("read dir")
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            ["cadenza.log.2026-01-03", "cadenza.log.2026-01-04", "notes.txt"]
        );
    }

    #[test]
    fn pruning_is_a_no_op_under_the_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("cadenza.log.2026-01-01"), b"line").expect("write log");
        assert_eq!(
            prune_rotated_logs(dir.path(), "cadenza.log", 7).expect("prune"),
            0
        );
    }
}
