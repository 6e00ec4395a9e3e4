//! Configuration file support for Huginn.
//!
//! Huginn data lives in a `.huginn/` directory:
//! - `.huginn/config.toml` - Configuration file
//! - `.huginn/logs/` - Log files when file logging is enabled
//!
//! Config discovery searches for `.huginn/config.toml` starting from the current
//! directory and walking up to parent directories.

use std::path::{Path, PathBuf};

/// The huginn data directory name.
pub const HUGINN_DIR: &str = ".huginn";
/// The config file name within the huginn directory.
pub const CONFIG_FILE: &str = "config.toml";

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Row view settings.
    pub view: ViewConfig,
    /// Snapshot sync settings.
    pub sync: SyncConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Row view configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewConfig {
    /// 0 hides completed spans, 3 shows internal spans, 4 shows everything.
    pub verbosity: i32,
    /// Show passthrough and hidden spans.
    pub debug: bool,
    /// Show all children even when some were explicitly revealed.
    pub reveal_noisy_spans: bool,
}

/// Snapshot sync configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often follow mode flushes snapshots, in milliseconds.
    pub flush_interval_ms: u64,
    /// Capture records ingested per step in follow mode.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            batch_size: 64,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write logs to daily rotating files instead of stderr.
    pub file: bool,
    /// Log directory, relative to the .huginn directory.
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: false,
            directory: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.huginn/config.toml` in the directory and its parents.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let huginn_dir = dir.join(HUGINN_DIR);
            let config_path = huginn_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                // Return the .huginn directory, not the config file
                return Ok(Some((config, huginn_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Resolve the log directory relative to the .huginn directory.
    pub fn resolve_log_dir(&self, huginn_dir: Option<&Path>) -> PathBuf {
        if self.logging.directory.is_absolute() {
            self.logging.directory.clone()
        } else if let Some(dir) = huginn_dir {
            dir.join(&self.logging.directory)
        } else {
            PathBuf::from(HUGINN_DIR).join(&self.logging.directory)
        }
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

impl Config {
    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if !(0..=4).contains(&self.view.verbosity) {
            errors.push(ConfigValidationError {
                field: "view.verbosity".to_string(),
                message: format!(
                    "Invalid verbosity {}. Expected a value from 0 to 4.",
                    self.view.verbosity
                ),
            });
        }

        if self.sync.flush_interval_ms == 0 {
            errors.push(ConfigValidationError {
                field: "sync.flush_interval_ms".to_string(),
                message: "Flush interval must be greater than zero.".to_string(),
            });
        }

        if self.sync.batch_size == 0 {
            errors.push(ConfigValidationError {
                field: "sync.batch_size".to_string(),
                message: "Batch size must be greater than zero.".to_string(),
            });
        }

        if self.logging.file && self.logging.directory.as_os_str().is_empty() {
            errors.push(ConfigValidationError {
                field: "logging.directory".to_string(),
                message: "Log directory cannot be empty when file logging is enabled.".to_string(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.view.verbosity, 0);
        assert!(!config.view.debug);
        assert_eq!(config.sync.flush_interval_ms, 100);
        assert_eq!(config.sync.batch_size, 64);
        assert!(!config.logging.file);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[view]
verbosity = 3
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.view.verbosity, 3);
        // Defaults should still apply
        assert_eq!(config.sync.batch_size, 64);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[view]
verbosity = 2
debug = true
reveal_noisy_spans = true

[sync]
flush_interval_ms = 250
batch_size = 16

[logging]
file = true
directory = "/var/log/huginn"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.view.verbosity, 2);
        assert!(config.view.debug);
        assert!(config.view.reveal_noisy_spans);
        assert_eq!(config.sync.flush_interval_ms, 250);
        assert_eq!(config.sync.batch_size, 16);
        assert!(config.logging.file);
        assert_eq!(
            config.resolve_log_dir(None),
            PathBuf::from("/var/log/huginn")
        );
    }

    #[test]
    fn test_resolve_log_dir() {
        let config = Config::default();
        let huginn_dir = PathBuf::from("/project/.huginn");
        assert_eq!(
            config.resolve_log_dir(Some(&huginn_dir)),
            PathBuf::from("/project/.huginn/logs")
        );
        assert_eq!(config.resolve_log_dir(None), PathBuf::from(".huginn/logs"));
    }

    #[test]
    fn test_find_and_load_walks_up() {
        let root = tempdir().unwrap();
        let huginn_dir = root.path().join(HUGINN_DIR);
        std::fs::create_dir_all(&huginn_dir).unwrap();
        std::fs::write(huginn_dir.join(CONFIG_FILE), "[view]\ndebug = true\n").unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let (config, dir) = Config::find_and_load_from(&nested).unwrap().unwrap();
        assert!(config.view.debug);
        assert_eq!(dir, huginn_dir);
    }

    #[test]
    fn test_find_and_load_none() {
        let root = tempdir().unwrap();
        // tempdirs live outside any project, so nothing is found above them
        let found = Config::find_and_load_from(root.path()).unwrap();
        assert!(found.is_none() || found.is_some_and(|(_, dir)| !dir.starts_with(root.path())));
    }

    #[test]
    fn test_validate_errors() {
        let mut config = Config::default();
        config.view.verbosity = 9;
        config.sync.flush_interval_ms = 0;
        config.sync.batch_size = 0;
        config.logging.file = true;
        config.logging.directory = PathBuf::new();

        let fields: Vec<String> = config.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "view.verbosity",
                "sync.flush_interval_ms",
                "sync.batch_size",
                "logging.directory"
            ]
        );
    }

    #[test]
    fn test_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[view\nverbosity = ").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
