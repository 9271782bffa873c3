use std::path::Path;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Base name of the daily-rolling host log.
pub const LOG_FILE_NAME: &str = "dockev.log";

/// Install the global subscriber: terminal output on stderr (`warn`, or
/// `debug` with `verbose`, overridable through `RUST_LOG`) and, when
/// `log_dir` is set, a daily file at `info` or `debug`.
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let terminal_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let terminal = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(if verbose { "debug" } else { "info" }));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(terminal)
        .with(file)
        .try_init()?;
    Ok(guard)
}

/// The most recent rolled log file in `log_dir`.
pub fn latest_log_file(log_dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(log_dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(LOG_FILE_NAME))
        })
        .collect();
    files.sort();
    files.pop()
}

/// Last `n` lines of a text file.
pub fn tail(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(ToString::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_latest_log_file_picks_newest_day() {
        let dir = TempDir::new().unwrap();
        assert_eq!(latest_log_file(dir.path()), None);

        std::fs::write(dir.path().join("dockev.log.2024-01-01"), "old").unwrap();
        std::fs::write(dir.path().join("dockev.log.2024-01-02"), "new").unwrap();
        std::fs::write(dir.path().join("other.txt"), "x").unwrap();
        assert_eq!(
            latest_log_file(dir.path()),
            Some(dir.path().join("dockev.log.2024-01-02"))
        );
    }

    #[test]
    fn test_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.log");
        std::fs::write(&path, "a\nb\nc\n").unwrap();
        assert_eq!(tail(&path, 2).unwrap(), vec!["b", "c"]);
        assert_eq!(tail(&path, 10).unwrap(), vec!["a", "b", "c"]);
        assert!(tail(&dir.path().join("missing"), 1).is_err());
    }
}
