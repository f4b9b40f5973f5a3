//! Logging setup: stderr for interactive runs, daily-rolled files for the service

use crate::service::LOG_FILE_PREFIX;
use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the background log writer alive; drop it only at exit
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Filter used when `RUST_LOG` is not set
///
/// 0 = info, 1 = debug, 2+ = trace for the autotun crates; everything else stays at warn.
pub fn default_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    format!(
        "warn,autotun={level},autotun_cli={level},autotun_client={level},autotun_transport={level},autotun_transport_ssh={level}"
    )
}

/// Install the global subscriber
///
/// With `log_dir` set, events go to `<log_dir>/autotun.log.<date>` without ANSI colours.
pub fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(verbose)))
        .context("Failed to initialize logging filter")?;

    match log_dir {
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_file(verbose >= 2)
                        .with_line_number(verbose >= 2),
                )
                .try_init()
                .context("Failed to install log subscriber")?;

            Ok(LogGuard { _worker: None })
        }
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {:?}", dir))?;

            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .context("Failed to install log subscriber")?;

            Ok(LogGuard {
                _worker: Some(guard),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert!(default_filter(0).contains("autotun_client=info"));
        assert!(default_filter(1).contains("autotun_transport_ssh=debug"));
        assert!(default_filter(5).contains("autotun=trace"));
        assert!(default_filter(0).starts_with("warn,"));
    }

    #[test]
    fn test_default_filter_parses() {
        for verbose in 0..3 {
            assert!(EnvFilter::try_new(default_filter(verbose)).is_ok());
        }
    }
}
