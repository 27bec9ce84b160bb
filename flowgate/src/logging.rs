//! Process-wide tracing setup.
//!
//! Library code only emits `tracing` events; binaries call [`init_logging`]
//! once to decide where they go.

use flowgate_shared::errors::{FlowgateError, FlowgateResult};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive for the life of the process.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Write to a daily rolling file in this directory instead of stderr.
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_prefix: "flowgate.log".to_string(),
            default_filter: "info".to_string(),
            ansi: true,
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(options: &LoggingOptions) -> FlowgateResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.default_filter))
        .map_err(|e| {
            FlowgateError::Configuration(format!(
                "invalid log filter '{}': {}",
                options.default_filter, e
            ))
        })?;
    if let Some(dir) = &options.log_dir {
        std::fs::create_dir_all(dir)?;
    }

    // The stored guard must belong to the writer that got installed, so only
    // one caller ever builds a subscriber.
    LOG_GUARD.get_or_init(|| install_subscriber(options, filter));
    Ok(())
}

fn install_subscriber(options: &LoggingOptions, filter: EnvFilter) -> Option<WorkerGuard> {
    let (installed, guard) = match &options.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &options.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            (installed, Some(guard))
        }
        None => {
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(options.ansi)
                .try_init();
            (installed, None)
        }
    };

    match installed {
        Ok(()) => guard,
        Err(e) => {
            // Someone else owns the global subscriber; leave it in place.
            tracing::debug!("global subscriber already installed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoggingOptions {
            log_dir: Some(dir.path().join("logs")),
            ..Default::default()
        };

        init_logging(&options).unwrap();
        init_logging(&LoggingOptions::default()).unwrap();

        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_concurrent_init_installs_once() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoggingOptions {
            log_dir: Some(dir.path().join("racing")),
            ..Default::default()
        };

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let options = options.clone();
                std::thread::spawn(move || init_logging(&options))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }

        assert!(LOG_GUARD.get().is_some());
        tracing::info!("written after concurrent init");
    }
}
