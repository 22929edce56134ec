//! Logging configuration.

use std::env;
use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::default(),
        })
    }
}

/// Configuration for the tracing subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log output format.
    log_format: LogFormat,
    /// Log level filter (e.g., "info", "warn,stockrep_cluster=debug").
    log_filter: String,
    /// Whether to include source location in logs.
    include_location: bool,
    /// Whether to include target in logs.
    include_target: bool,
    /// Whether to include thread IDs in logs.
    include_thread_ids: bool,
    /// Write to stderr instead of stdout.
    ///
    /// The interactive menu owns stdout, so the CLI logs to stderr.
    use_stderr: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info".to_string(),
            include_location: false,
            include_target: true,
            include_thread_ids: false,
            use_stderr: false,
        }
    }
}

impl TracingConfig {
    /// Create a new builder.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STOCKREP_LOG_FORMAT`: "json", "pretty", or "compact"
    /// - `STOCKREP_LOG_LEVEL` or `RUST_LOG`: Log filter string, falling
    ///   back to `default_filter` when neither is set
    /// - `STOCKREP_LOG_LOCATION`: "true" to include file and line
    pub fn from_env(default_filter: &str) -> Self {
        Self::from_vars(default_filter, |key| env::var(key).ok())
    }

    fn from_vars(default_filter: &str, var: impl Fn(&str) -> Option<String>) -> Self {
        let log_format = var("STOCKREP_LOG_FORMAT")
            .and_then(|s| s.parse::<LogFormat>().ok())
            .unwrap_or_default();

        let log_filter = var("STOCKREP_LOG_LEVEL")
            .or_else(|| var("RUST_LOG"))
            .unwrap_or_else(|| default_filter.to_string());

        Self {
            log_format,
            log_filter,
            include_location: var("STOCKREP_LOG_LOCATION")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
            ..Self::default()
        }
    }

    /// Get the log format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Get the log filter.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Check if source location should be included.
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /// Check if target should be included.
    pub fn include_target(&self) -> bool {
        self.include_target
    }

    /// Check if thread IDs should be included.
    pub fn include_thread_ids(&self) -> bool {
        self.include_thread_ids
    }

    /// Check if output goes to stderr.
    pub fn use_stderr(&self) -> bool {
        self.use_stderr
    }
}

/// Builder for TracingConfig.
#[derive(Debug, Clone, Default)]
pub struct TracingConfigBuilder {
    log_format: Option<LogFormat>,
    log_filter: Option<String>,
    include_location: Option<bool>,
    include_target: Option<bool>,
    include_thread_ids: Option<bool>,
    use_stderr: Option<bool>,
}

impl TracingConfigBuilder {
    /// Start from an existing configuration, e.g. one read from the environment.
    pub fn from_config(config: TracingConfig) -> Self {
        Self {
            log_format: Some(config.log_format),
            log_filter: Some(config.log_filter),
            include_location: Some(config.include_location),
            include_target: Some(config.include_target),
            include_thread_ids: Some(config.include_thread_ids),
            use_stderr: Some(config.use_stderr),
        }
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Set the log filter.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Include source location in logs.
    pub fn include_location(mut self, include: bool) -> Self {
        self.include_location = Some(include);
        self
    }

    /// Include target in logs.
    pub fn include_target(mut self, include: bool) -> Self {
        self.include_target = Some(include);
        self
    }

    /// Include thread IDs in logs.
    pub fn include_thread_ids(mut self, include: bool) -> Self {
        self.include_thread_ids = Some(include);
        self
    }

    /// Write logs to stderr.
    pub fn use_stderr(mut self, enable: bool) -> Self {
        self.use_stderr = Some(enable);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TracingConfig {
        let defaults = TracingConfig::default();
        TracingConfig {
            log_format: self.log_format.unwrap_or(defaults.log_format),
            log_filter: self.log_filter.unwrap_or(defaults.log_filter),
            include_location: self.include_location.unwrap_or(defaults.include_location),
            include_target: self.include_target.unwrap_or(defaults.include_target),
            include_thread_ids: self
                .include_thread_ids
                .unwrap_or(defaults.include_thread_ids),
            use_stderr: self.use_stderr.unwrap_or(defaults.use_stderr),
        }
    }
}
