use std::env;
use std::path::PathBuf;

/// Default slack: usage may arrive up to five minutes late (or early).
pub const DEFAULT_SLACK_MS: i64 = 5 * 60 * 1000;

/// Sealed slots kept per resolution unless configured otherwise.
pub const DEFAULT_RETAINED_SLOTS: usize = 2;

/// Configuration for the metering engine and its CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path (default: `.metering-engine/` in current directory)
    pub data_dir: PathBuf,

    /// Output format: "human" (default) or "json"
    pub output_format: String,

    /// Log level: "info", "debug", "warn", "error" (default: "info")
    pub log_level: String,

    /// Maximum lateness of usage relative to processing time, in milliseconds
    pub slack_ms: i64,

    /// Country key used for price lookups
    pub country: String,

    /// Attempts for a storage write before giving up
    pub retry_attempts: u32,

    /// First backoff delay in milliseconds; doubles per attempt
    pub retry_base_ms: u64,

    /// Sealed slots kept per resolution per resource instance
    pub retained_slots: usize,
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        let data_dir = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".metering-engine");

        Config {
            data_dir,
            output_format: "human".to_string(),
            log_level: "info".to_string(),
            slack_ms: DEFAULT_SLACK_MS,
            country: "USA".to_string(),
            retry_attempts: 5,
            retry_base_ms: 50,
            retained_slots: DEFAULT_RETAINED_SLOTS,
        }
    }

    /// Create config with custom data directory
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Config {
            data_dir,
            ..Config::new()
        }
    }

    /// Get the data directory path
    pub fn get_data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Set data directory
    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    /// Get output format
    pub fn get_output_format(&self) -> &str {
        &self.output_format
    }

    /// Set output format ("human" or "json")
    pub fn set_output_format(&mut self, format: String) {
        self.output_format = format;
    }

    /// Get log level
    pub fn get_log_level(&self) -> &str {
        &self.log_level
    }

    /// Set log level ("error", "warn", "info", "debug" or "trace")
    pub fn set_log_level(&mut self, level: String) {
        self.log_level = level;
    }

    /// Set the slack window in milliseconds
    pub fn set_slack_ms(&mut self, slack_ms: i64) {
        self.slack_ms = slack_ms;
    }

    /// Get usage log path
    pub fn get_usage_log_path(&self) -> PathBuf {
        self.data_dir.join("usage.log")
    }

    /// Directory holding one snapshot file per organization
    pub fn get_snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Load config from environment variables
    ///
    /// Environment variables:
    /// - `METERING_ENGINE_DATA_DIR`: override data directory
    /// - `METERING_ENGINE_OUTPUT_FORMAT`: "human" or "json"
    /// - `METERING_ENGINE_LOG_LEVEL`: log level
    /// - `METERING_ENGINE_SLACK_MS`: slack window in milliseconds
    /// - `METERING_ENGINE_COUNTRY`: price list country
    /// - `METERING_ENGINE_RETRY_ATTEMPTS`, `METERING_ENGINE_RETRY_BASE_MS`: storage retry policy
    /// - `METERING_ENGINE_RETAINED_SLOTS`: sealed slot history length
    ///
    /// Unparseable numeric values keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Config::new();

        if let Ok(dir) = env::var("METERING_ENGINE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(format) = env::var("METERING_ENGINE_OUTPUT_FORMAT") {
            config.output_format = format;
        }

        if let Ok(level) = env::var("METERING_ENGINE_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(slack) = parse_env("METERING_ENGINE_SLACK_MS") {
            config.slack_ms = slack;
        }

        if let Ok(country) = env::var("METERING_ENGINE_COUNTRY") {
            config.country = country;
        }

        if let Some(attempts) = parse_env("METERING_ENGINE_RETRY_ATTEMPTS") {
            config.retry_attempts = attempts;
        }

        if let Some(base) = parse_env("METERING_ENGINE_RETRY_BASE_MS") {
            config.retry_base_ms = base;
        }

        if let Some(kept) = parse_env("METERING_ENGINE_RETAINED_SLOTS") {
            config.retained_slots = kept;
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
