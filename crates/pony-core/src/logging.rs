//! Tracing setup shared by the daemon binaries.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Crates whose events pass the default filter.
const CRATES: [&str; 4] = ["pony_core", "pony_rpc", "pony_daemon", "pony_types"];

fn default_directives(level: &str, daemon: &str) -> String {
    let mut directives: Vec<String> = CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect();
    directives.push(format!("{daemon}={level}"));
    directives.join(",")
}

/// Set up logging for `daemon`.
///
/// In debug builds, defaults to debug level and logs both to stderr and to a
/// timestamped file in the temp directory, with `<daemon>.log` symlinked to
/// the latest one. In release builds, defaults to info level and logs to
/// stderr. `RUST_LOG` overrides the level in both.
///
/// Keep the returned guard alive until exit; dropping it flushes the file
/// writer.
#[must_use = "dropping the guard stops file logging"]
pub fn setup_logging(daemon: &str) -> Option<WorkerGuard> {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(default_level, daemon)));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("{daemon}-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join(format!("{daemon}.log"));
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        let installed = tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .try_init();

        if installed.is_err() {
            return None;
        }

        eprintln!("Logging to: {} (and stderr)", log_path.display());
        Some(guard)
    } else {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_cover_workspace_and_binary() {
        let directives = default_directives("info", "sparkle");
        assert!(directives.contains("pony_rpc=info"));
        assert!(directives.contains("pony_core=info"));
        assert!(directives.ends_with("sparkle=info"));
    }

    #[test]
    fn test_default_directives_parse() {
        let directives = default_directives("debug", "twilight");
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
