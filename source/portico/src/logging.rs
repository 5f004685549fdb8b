//! Configuration-driven tracing setup.

use std::sync::Arc;

use portico_config::internal::{LogLevel, LogSettings};
use tracing::level_filters::LevelFilter;

/// More-verbose configured levels admit everything below them; NONE silences
/// the subscriber entirely.
fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::All => LevelFilter::TRACE,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::None => LevelFilter::OFF,
    }
}

/// Install the global subscriber. Call once, after the configuration is
/// loaded.
pub fn init(settings: &LogSettings) {
    let level = level_filter(settings.level);

    if let Some(path) = &settings.file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_thread_ids(true)
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .init();
                return;
            }
            Err(err) => {
                eprintln!(
                    "could not open log file {} ({err}), logging to console instead",
                    path.display()
                );
            }
        }
    }

    let level = if settings.to_console {
        level
    } else {
        LevelFilter::OFF
    };

    tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_max_level(level)
        .init();
}
