//! Configuration file support for tracewire.
//!
//! All tracewire data is stored in a `.tracewire/` directory:
//! - `.tracewire/config.toml` - Configuration file
//! - `.tracewire/traces/` - Captured telemetry (JSONL)
//! - `.tracewire/logs/` - Log files, when file logging is enabled
//!
//! Config discovery searches for `.tracewire/config.toml` starting from the
//! current directory and walking up to parent directories.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracewire_tracing::{ClientOptions, WriterConfig};
use tracewire_worker::WorkerConfig;

/// The tracewire data directory name.
pub const TRACEWIRE_DIR: &str = ".tracewire";
/// The config file name within the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Reporting client settings.
    pub reporting: ReportingConfig,
    /// Telemetry output settings.
    pub traces: TracesConfig,
    /// Process logging settings.
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Durable Object the API routes call into.
    pub object_name: String,
    /// Delay before forked programs start, in milliseconds.
    pub fork_delay_ms: u64,
    /// Random pause around handler work, in milliseconds.
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            enable_cors: true,
            object_name: "static-name".to_string(),
            fork_delay_ms: 1000,
            jitter_min_ms: 10,
            jitter_max_ms: 100,
        }
    }
}

/// Reporting client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub environment: Option<String>,
    pub release: Option<String>,
    /// Fraction of new traces to keep, `0.0..=1.0`.
    pub traces_sample_rate: f64,
    /// Log a summary of every captured transaction.
    pub debug: bool,
    /// Ship log records attached to transactions.
    pub enable_logs: bool,
    /// Transactions whose name contains any of these are dropped.
    pub ignore_transactions: Vec<String>,
    pub flush_timeout_ms: u64,
    /// Value of the `cloud.provider` tag.
    pub cloud_provider: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        let options = ClientOptions::default();
        Self {
            environment: None,
            release: None,
            traces_sample_rate: options.traces_sample_rate,
            debug: options.debug,
            enable_logs: options.enable_logs,
            ignore_transactions: options.ignore_transactions,
            flush_timeout_ms: options.flush_timeout.as_millis() as u64,
            cloud_provider: tracewire_worker::WorkerConfig::default().cloud_provider,
        }
    }
}

/// Telemetry output configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracesConfig {
    /// Output directory, relative to `.tracewire/` unless absolute.
    pub path: PathBuf,
    pub enabled: bool,
    /// Write one file per run instead of one per day.
    pub session_mode: bool,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("traces"),
            enabled: true,
            session_mode: false,
        }
    }
}

/// Process logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log to daily rotated files instead of stderr.
    pub to_file: bool,
    /// Log directory, relative to `.tracewire/` unless absolute.
    pub dir: PathBuf,
    /// Minimum level of events copied into the active trace. Applies on its
    /// own: `RUST_LOG` and `--verbose` only filter log output.
    pub ship_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            to_file: false,
            dir: PathBuf::from("logs"),
            ship_level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn ship_level(&self) -> Result<tracing::Level> {
        self.ship_level
            .parse()
            .with_context(|| format!("Invalid log level: {}", self.ship_level))
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
    /// Looks for `.tracewire/config.toml` in the directory and its parents.
    /// Returns the config and the `.tracewire` directory it was found in.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let data_dir = dir.join(TRACEWIRE_DIR);
            let config_path = data_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, data_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Resolve `path` relative to the data directory.
    pub fn resolve_path(data_dir: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            data_dir.join(path)
        }
    }

    /// Options for every reporting client the worker builds.
    pub fn client_options(&self) -> ClientOptions {
        let reporting = &self.reporting;
        ClientOptions {
            environment: reporting.environment.clone(),
            release: reporting.release.clone(),
            traces_sample_rate: reporting.traces_sample_rate,
            debug: reporting.debug,
            enable_logs: reporting.enable_logs,
            ignore_transactions: reporting.ignore_transactions.clone(),
            flush_timeout: Duration::from_millis(reporting.flush_timeout_ms),
        }
    }

    /// Telemetry writer settings, resolved against the data directory.
    pub fn writer_config(&self, data_dir: &Path) -> WriterConfig {
        if !self.traces.enabled {
            return WriterConfig::disabled();
        }
        let path = Self::resolve_path(data_dir, &self.traces.path);
        if self.traces.session_mode {
            let started = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            WriterConfig::session(path.join(format!("session-{started}.jsonl")))
        } else {
            WriterConfig::daily_rotation(path)
        }
    }

    /// Worker settings for a server bound to `addr`.
    pub fn worker_config(&self, addr: SocketAddr) -> WorkerConfig {
        let mut worker = WorkerConfig::new(addr)
            .with_client_options(self.client_options())
            .with_cloud_provider(self.reporting.cloud_provider.clone())
            .with_fork_delay(Duration::from_millis(self.server.fork_delay_ms))
            .with_jitter_ms(self.server.jitter_min_ms, self.server.jitter_max_ms);
        worker.enable_cors = self.server.enable_cors;
        worker.object_name = self.server.object_name.clone();
        worker
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
        let mut push = |field: &str, message: String| {
            errors.push(ConfigValidationError {
                field: field.to_string(),
                message,
            });
        };

        if self.server.host.trim().is_empty() {
            push("server.host", "Host cannot be empty.".to_string());
        }

        if self.server.object_name.trim().is_empty() {
            push("server.object_name", "Object name cannot be empty.".to_string());
        }

        if self.server.jitter_min_ms > self.server.jitter_max_ms {
            push(
                "server.jitter_min_ms",
                format!(
                    "Minimum jitter ({}) exceeds maximum ({}).",
                    self.server.jitter_min_ms, self.server.jitter_max_ms
                ),
            );
        }

        let rate = self.reporting.traces_sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            push(
                "reporting.traces_sample_rate",
                format!("Sample rate {rate} is outside 0.0..=1.0."),
            );
        }

        if self.reporting.flush_timeout_ms == 0 {
            push(
                "reporting.flush_timeout_ms",
                "Flush timeout must be greater than zero.".to_string(),
            );
        }

        if self.reporting.cloud_provider.trim().is_empty() {
            push(
                "reporting.cloud_provider",
                "Cloud provider cannot be empty.".to_string(),
            );
        }

        if self.logging.ship_level().is_err() {
            push(
                "logging.ship_level",
                format!(
                    "Invalid level '{}'. Expected one of: error, warn, info, debug, trace.",
                    self.logging.ship_level
                ),
            );
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.reporting.traces_sample_rate, 1.0);
        assert_eq!(config.reporting.flush_timeout_ms, 2000);
        assert_eq!(config.reporting.ignore_transactions, vec!["/favicon.ico"]);
        assert_eq!(config.traces.path, PathBuf::from("traces"));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[reporting]
environment = "staging"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.reporting.environment.as_deref(), Some("staging"));
        // Defaults should still apply
        assert!(config.reporting.enable_logs);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
host = "0.0.0.0"
port = 9000
enable_cors = false
object_name = "shared"
fork_delay_ms = 50
jitter_min_ms = 0
jitter_max_ms = 0

[reporting]
environment = "production"
release = "1.2.3"
traces_sample_rate = 0.25
debug = true
enable_logs = false
ignore_transactions = ["/favicon.ico", "/health"]
flush_timeout_ms = 500
cloud_provider = "local"

[traces]
path = "/var/lib/tracewire"
enabled = true
session_mode = true

[logging]
to_file = true
dir = "out"
ship_level = "error"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(!config.server.enable_cors);
        assert_eq!(config.reporting.release.as_deref(), Some("1.2.3"));
        assert_eq!(config.reporting.ignore_transactions.len(), 2);
        assert!(config.traces.session_mode);
        assert_eq!(config.logging.ship_level().unwrap(), tracing::Level::ERROR);
        assert!(config.validate().is_empty());

        let options = config.client_options();
        assert_eq!(options.environment.as_deref(), Some("production"));
        assert_eq!(options.traces_sample_rate, 0.25);
        assert!(!options.enable_logs);
        assert_eq!(options.flush_timeout, Duration::from_millis(500));

        let worker = config.worker_config("127.0.0.1:9000".parse().unwrap());
        assert_eq!(worker.cloud_provider, "local");
        assert_eq!(worker.object_name, "shared");
        assert_eq!(worker.jitter_ms, (0, 0));
        assert!(!worker.enable_cors);
    }

    #[test]
    fn test_find_and_load_walks_up() {
        let temp = tempfile::tempdir().unwrap();
        let data_dir = temp.path().join(TRACEWIRE_DIR);
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join(CONFIG_FILE), "[server]\nport = 1234\n").unwrap();

        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let (config, found) = Config::find_and_load_from(&nested).unwrap().unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(found, data_dir);
    }

    #[test]
    fn test_find_and_load_none() {
        let temp = tempfile::tempdir().unwrap();
        // Only searches upward from an empty temp dir; parents are not ours to
        // control, so accept either outcome but never an error
        assert!(Config::find_and_load_from(temp.path()).is_ok());
    }

    #[test]
    fn test_parse_error_has_context() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[server\nport = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_writer_config_resolution() {
        let data_dir = PathBuf::from("/project/.tracewire");
        let mut config = Config::default();

        let writer = config.writer_config(&data_dir);
        assert_eq!(writer.trace_path, PathBuf::from("/project/.tracewire/traces"));
        assert!(!writer.session_mode);

        config.traces.session_mode = true;
        let writer = config.writer_config(&data_dir);
        assert!(writer.session_mode);
        assert!(writer.trace_path.starts_with("/project/.tracewire/traces"));

        config.traces.enabled = false;
        assert!(!config.writer_config(&data_dir).enabled);
    }

    #[test]
    fn test_validate_reports_fields() {
        let mut config = Config::default();
        config.reporting.traces_sample_rate = 1.5;
        config.reporting.flush_timeout_ms = 0;
        config.logging.ship_level = "loud".to_string();
        config.server.jitter_min_ms = 200;

        let errors = config.validate();
        for field in [
            "reporting.traces_sample_rate",
            "reporting.flush_timeout_ms",
            "logging.ship_level",
            "server.jitter_min_ms",
        ] {
            assert!(errors.iter().any(|e| e.field == field), "missing {field}");
        }
    }
}
