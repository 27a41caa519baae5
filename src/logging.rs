//! Log setup for the agent
//!
//! Lines go to a daily rolling file and, on macOS, to unified logging.
//! Session owner tasks run inside a `session` span carrying the role,
//! instance and current session id, so one stream's history can be pulled
//! out of the file with a single grep.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_BASENAME: &str = "livecast.log";
const LOG_DIR_ENV: &str = "LIVECAST_LOG_PATH";

/// Subsystem for macOS unified logging (os_log)
#[cfg(target_os = "macos")]
const OSLOG_SUBSYSTEM: &str = "dev.livecast.agent";

/// Directory the log files go to: `LIVECAST_LOG_PATH`, then the configured
/// directory, then the platform default
pub fn log_dir(config: &LoggingConfig) -> Result<PathBuf> {
    choose_log_dir(
        std::env::var_os(LOG_DIR_ENV).map(PathBuf::from),
        config.dir.as_deref(),
    )
}

/// Install the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    let dir = log_dir(config)?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {:?}", dir))?;

    if let Some(max_age) = config.retention() {
        prune_old_logs(&dir, max_age);
    }

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_BASENAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);
    let filter = env_filter(std::env::var("RUST_LOG").ok(), &config.level);

    #[cfg(target_os = "macos")]
    {
        // `log stream --predicate 'subsystem == "dev.livecast.agent"'`
        let oslog_layer = tracing_oslog::OsLogger::new(OSLOG_SUBSYSTEM, "default");

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(oslog_layer)
            .init();
    }

    #[cfg(not(target_os = "macos"))]
    {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();
    }

    Ok(guard)
}

/// RUST_LOG wins over the configured level; unparseable directives fall
/// through to the next source
fn env_filter(from_env: Option<String>, configured: &str) -> EnvFilter {
    from_env
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(configured).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn choose_log_dir(from_env: Option<PathBuf>, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = from_env {
        return Ok(dir);
    }
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }
    platform_log_dir()
}

fn platform_log_dir() -> Result<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("Failed to determine home directory for log path")?;
        return Ok(home.join("Library").join("Logs").join("livecast"));
    }

    let proj_dirs = ProjectDirs::from("dev", "livecast", "agent")
        .context("Failed to determine project directories for log path")?;

    #[cfg(target_os = "linux")]
    {
        let base = proj_dirs
            .state_dir()
            .unwrap_or_else(|| proj_dirs.data_local_dir());
        return Ok(base.join("logs"));
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        return Ok(proj_dirs.data_local_dir().join("logs"));
    }
}

/// Delete rolled log files whose last write is older than `max_age`
fn prune_old_logs(log_dir: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_BASENAME))
            .unwrap_or(false);
        if !is_log || !path.is_file() {
            continue;
        }

        let modified = entry.metadata().and_then(|m| m.modified());
        if matches!(modified, Ok(modified) if modified < cutoff) {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_log_dir_precedence() {
        let from_env = PathBuf::from("/tmp/livecast-env-logs");
        let configured = PathBuf::from("/var/log/livecast");

        assert_eq!(
            choose_log_dir(Some(from_env.clone()), Some(&configured)).unwrap(),
            from_env
        );
        assert_eq!(choose_log_dir(None, Some(&configured)).unwrap(), configured);
    }

    #[test]
    fn test_filter_prefers_rust_log() {
        assert_eq!(env_filter(Some("warn".to_string()), "debug").to_string(), "warn");
        assert_eq!(env_filter(Some("  ".to_string()), "debug").to_string(), "debug");
        assert_eq!(env_filter(None, "livecast=trace").to_string(), "livecast=trace");
    }

    #[test]
    fn test_prune_removes_only_stale_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(format!("{}.2020-01-01", LOG_FILE_BASENAME));
        let fresh = dir.path().join(format!("{}.2099-01-01", LOG_FILE_BASENAME));
        let other = dir.path().join("notes.txt");

        for path in [&stale, &fresh, &other] {
            File::create(path).unwrap();
        }
        let old = SystemTime::now() - Duration::from_secs(60 * 60 * 24 * 30);
        for path in [&stale, &other] {
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(old)
                .unwrap();
        }

        let retention = LoggingConfig::default().retention().unwrap();
        prune_old_logs(dir.path(), retention);

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }
}
