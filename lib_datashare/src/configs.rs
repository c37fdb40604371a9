//! # Configuration
//!
//! Settings for the client side of DataShare, layered as
//! built-in defaults <- JSON file <- `DATASHARE_*` environment variables.
//! The library never reads the process arguments; binaries that want command
//! line overrides parse [`DataShareConfig`] themselves and merge the result.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::errors::DataShareError;
use crate::manager::ReconnectPolicy;

/// Default name of the JSON configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "datashare.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "DataShare client subscription settings", version)]
#[serde(rename_all = "camelCase")]
pub struct DataShareConfig {
    #[clap(long, env = "DATASHARE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DATASHARE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DATASHARE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DATASHARE_RECONNECT_DELAY_MS", help = "Delay in milliseconds before each reconnect attempt.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "DATASHARE_RECONNECT_MAX_ATTEMPTS", help = "Reconnect attempts before recovery gives up.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "DATASHARE_BUNDLE_NAME", help = "Bundle name used for templates and publishing.")]
    pub bundle_name: Option<String>,
}

impl DataShareConfig {
    /// Merges two configs; `Some` values of `other` win.
    pub fn merge(self, other: DataShareConfig) -> DataShareConfig {
        DataShareConfig {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            bundle_name: other.bundle_name.or(self.bundle_name),
        }
    }

    pub fn defaults() -> DataShareConfig {
        DataShareConfig {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            reconnect_delay_ms: Some(1000),
            reconnect_max_attempts: Some(10),
            bundle_name: Some("com.example.datashare".to_string()),
            ..Default::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let fallback = ReconnectPolicy::default();
        ReconnectPolicy {
            delay: self.reconnect_delay_ms.map(Duration::from_millis).unwrap_or(fallback.delay),
            max_attempts: self.reconnect_max_attempts.unwrap_or(fallback.max_attempts),
        }
    }

    /// Values taken from the `DATASHARE_*` environment variables only.
    pub fn from_env() -> DataShareConfig {
        match DataShareConfig::try_parse_from(["lib_datashare"]) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring invalid DATASHARE_* environment: {}", e);
                DataShareConfig::default()
            }
        }
    }
}

/// Reads a JSON config file.
pub fn read_config_file(path: &Path) -> Result<DataShareConfig, DataShareError> {
    let config_str = fs::read_to_string(path)?;
    Ok(serde_json::from_str::<DataShareConfig>(&config_str)?)
}

/// Loads the layered configuration from the process environment.
///
/// The file is `path` if given, else `DATASHARE_CONFIG_PATH`, else
/// [`DEFAULT_CONFIG_FILE`] in the working directory. A missing or malformed
/// file is logged and skipped.
pub fn load_config(path: Option<&Path>) -> DataShareConfig {
    load_config_from(path, DataShareConfig::from_env())
}

/// Same as [`load_config`], with the environment layer supplied by the caller.
pub fn load_config_from(path: Option<&Path>, env_config: DataShareConfig) -> DataShareConfig {
    // 1. Defaults
    let mut current_config = DataShareConfig::defaults();

    // 2. Config file
    let config_file_path = path
        .map(Path::to_path_buf)
        .or_else(|| env_config.config_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        match read_config_file(&config_file_path) {
            Ok(file_config) => current_config = current_config.merge(file_config),
            Err(e) => log::warn!(
                "Failed to load config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment variables.",
            config_file_path.display()
        );
    }
    current_config.config_path = Some(config_file_path);

    // 3. Environment
    current_config.merge(DataShareConfig {
        config_path: None,
        ..env_config
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_merge_prefers_other() {
        let base = DataShareConfig::defaults();
        let other = DataShareConfig {
            log_level: Some("debug".into()),
            ..Default::default()
        };
        let merged = base.merge(other);
        assert_eq!(merged.log_level.as_deref(), Some("debug"));
        assert_eq!(merged.reconnect_delay_ms, Some(1000));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reconnectDelayMs": 25, "reconnectMaxAttempts": 3}}"#).unwrap();

        let config = load_config(Some(file.path()));

        assert_eq!(config.reconnect_delay_ms, Some(25));
        assert_eq!(config.reconnect_max_attempts, Some(3));
        assert_eq!(config.config_path.as_deref(), Some(file.path()));
        let policy = config.reconnect_policy();
        assert_eq!(policy.delay, Duration::from_millis(25));
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        assert!(read_config_file(file.path()).is_err());
        let config = load_config(Some(file.path()));
        assert_eq!(config.reconnect_max_attempts, Some(10));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bundleName": "from.file", "logLevel": "warn"}}"#).unwrap();
        let env_config = DataShareConfig {
            bundle_name: Some("from.env".into()),
            ..Default::default()
        };

        let config = load_config_from(Some(file.path()), env_config);

        assert_eq!(config.bundle_name.as_deref(), Some("from.env"));
        assert_eq!(config.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn test_env_config_path_locates_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reconnectMaxAttempts": 4}}"#).unwrap();
        let env_config = DataShareConfig {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = load_config_from(None, env_config);

        assert_eq!(config.reconnect_max_attempts, Some(4));
        assert_eq!(config.config_path.as_deref(), Some(file.path()));
    }
}
