//! Structured logging setup.
//!
//! Format is controlled via `STOCKREP_LOG_FORMAT`:
//! - `json` - one JSON object per event
//! - `pretty` - multi-line human-readable output
//! - `compact` - single-line output (default)
//!
//! ```ignore
//! use stockrep_cluster::observability::{LogFormat, TracingConfig, init_tracing};
//!
//! let config = TracingConfig::builder()
//!     .log_format(LogFormat::Json)
//!     .log_filter("debug")
//!     .build();
//! let _guard = init_tracing(config)?;
//! ```

mod config;
mod tracing_setup;

pub use config::{LogFormat, TracingConfig, TracingConfigBuilder};
pub use tracing_setup::{TracingGuard, init_tracing};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.log_format(), LogFormat::Compact);
        assert_eq!(config.log_filter(), "info");
        assert!(!config.use_stderr());
    }

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::builder()
            .log_format(LogFormat::Json)
            .log_filter("debug")
            .use_stderr(true)
            .build();

        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.log_filter(), "debug");
        assert!(config.use_stderr());
        assert!(config.include_target());
    }

    #[test]
    fn test_builder_from_config_keeps_values() {
        let base = TracingConfig::builder().log_format(LogFormat::Pretty).build();
        let config = TracingConfigBuilder::from_config(base).log_filter("warn").build();

        assert_eq!(config.log_format(), LogFormat::Pretty);
        assert_eq!(config.log_filter(), "warn");
    }

    #[test]
    fn test_unknown_format_falls_back() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("xml".parse::<LogFormat>().unwrap(), LogFormat::Compact);
    }
}
