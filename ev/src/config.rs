//! evio configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::{DEFAULT_MAX_LISTENERS, DispatchMode};

/// Main evio configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus defaults
    pub events: EventsConfig,

    /// Stream defaults
    pub stream: StreamConfig,

    /// Background work queue
    #[serde(rename = "work-queue")]
    pub work_queue: WorkQueueConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// An explicit path must load. Otherwise `./.evio.yml` and then
    /// `<config_dir>/evio/evio.yml` are tried; a file that fails to load is
    /// skipped with a warning. Defaults apply when nothing loads.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let candidates = std::iter::once(PathBuf::from(".evio.yml"))
            .chain(dirs::config_dir().map(|dir| dir.join("evio").join("evio.yml")));
        for path in candidates.filter(|p| p.exists()) {
            match Self::load_from_file(&path) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Config::load: skipping config file"),
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream.read_buffer_size == 0 {
            eyre::bail!("stream.read-buffer-size must be greater than 0");
        }
        if self.stream.delimiter.is_empty() {
            eyre::bail!("stream.delimiter must not be empty");
        }
        Ok(())
    }
}

/// Event bus defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Listener limit per event (0 = unlimited)
    #[serde(rename = "max-listeners")]
    pub max_listeners: usize,

    /// How listeners whose shape does not match the payload are treated
    pub dispatch: DispatchMode,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_listeners: DEFAULT_MAX_LISTENERS,
            dispatch: DispatchMode::Lenient,
        }
    }
}

/// Stream defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Size of each low-level read, and the frame size in fill-buffer mode
    #[serde(rename = "read-buffer-size")]
    pub read_buffer_size: usize,

    /// Initial delimiter for delimiter and double-delimiter modes
    pub delimiter: String,

    /// Close the stream after delivering the end-of-stream frame
    #[serde(rename = "close-on-eof")]
    pub close_on_eof: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            delimiter: "\n".to_string(),
            close_on_eof: false,
        }
    }
}

/// Background work queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    /// Worker bound (0 = host core count)
    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// How long an idle worker waits for work before retiring
    #[serde(rename = "idle-timeout-ms")]
    pub idle_timeout_ms: u64,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            idle_timeout_ms: 50,
        }
    }
}

impl WorkQueueConfig {
    /// Worker bound with 0 resolved to the host core count
    pub fn effective_max_workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.events.max_listeners, 10);
        assert_eq!(config.events.dispatch, DispatchMode::Lenient);
        assert_eq!(config.stream.read_buffer_size, 8192);
        assert_eq!(config.stream.delimiter, "\n");
        assert!(!config.stream.close_on_eof);
        assert_eq!(config.work_queue.max_workers, 0);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_effective_max_workers() {
        let config = WorkQueueConfig::default();
        assert!(config.effective_max_workers() >= 1);

        let config = WorkQueueConfig {
            max_workers: 3,
            ..Default::default()
        };
        assert_eq!(config.effective_max_workers(), 3);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
events:
  max-listeners: 0
  dispatch: strict

stream:
  read-buffer-size: 1024
  delimiter: "\r\n"
  close-on-eof: true

work-queue:
  max-workers: 4
  idle-timeout-ms: 250

log-level: debug
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.events.max_listeners, 0);
        assert_eq!(config.events.dispatch, DispatchMode::Strict);
        assert_eq!(config.stream.read_buffer_size, 1024);
        assert_eq!(config.stream.delimiter, "\r\n");
        assert!(config.stream.close_on_eof);
        assert_eq!(config.work_queue.max_workers, 4);
        assert_eq!(config.work_queue.idle_timeout(), Duration::from_millis(250));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
stream:
  close-on-eof: true
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        // Specified value
        assert!(config.stream.close_on_eof);

        // Defaults for unspecified
        assert_eq!(config.stream.read_buffer_size, 8192);
        assert_eq!(config.events.max_listeners, 10);
        assert_eq!(config.work_queue.idle_timeout_ms, 50);
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "events:\n  max-listeners: 3").unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.events.max_listeners, 3);
    }

    #[test]
    fn test_load_rejects_zero_read_buffer() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "stream:\n  read-buffer-size: 0").unwrap();

        let err = Config::load(Some(&file.path().to_path_buf())).unwrap_err();
        assert!(format!("{err:#}").contains("read-buffer-size"));
    }

    #[test]
    fn test_validate_rejects_empty_delimiter() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.stream.delimiter.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let path = PathBuf::from("/nonexistent/evio.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
