//! # Logging Setup
//!
//! Library code only talks to the `log` facade. Binaries call
//! [`setup_logging`] once to route records to stdout and a timestamped file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::DataShareError;

/// Maps a level name onto a filter; unknown names mean `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger. Returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<PathBuf, DataShareError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep only the most recent log from earlier runs.
    cleanup_old_logs(log_dir)?;

    let log_file_name = format!("datashare_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

/// Deletes every `.log` file in `log_dir` except the newest one.
pub fn cleanup_old_logs(log_dir: &Path) -> Result<(), DataShareError> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            log::warn!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}
