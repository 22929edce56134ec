//! Tracing subscriber setup with format selection.

use anyhow::{Context, Result};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use super::{TracingConfig, config::LogFormat};

/// Handle returned by [`init_tracing`]; keep it alive for the duration of
/// the program.
#[must_use]
pub struct TracingGuard {
    _private: (),
}

/// Initialize tracing with the given configuration.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_new(config.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = || {
        if config.use_stderr() {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::stdout)
        }
    };

    match config.log_format() {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer())
                        .with_file(config.include_location())
                        .with_line_number(config.include_location())
                        .with_target(config.include_target())
                        .with_thread_ids(config.include_thread_ids())
                        .with_span_events(FmtSpan::CLOSE)
                        .flatten_event(true),
                )
                .try_init()
                .context("Failed to initialize tracing subscriber")?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .pretty()
                        .with_writer(writer())
                        .with_file(config.include_location())
                        .with_line_number(config.include_location())
                        .with_target(config.include_target())
                        .with_thread_ids(config.include_thread_ids()),
                )
                .try_init()
                .context("Failed to initialize tracing subscriber")?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(writer())
                        .with_file(config.include_location())
                        .with_line_number(config.include_location())
                        .with_target(config.include_target())
                        .with_thread_ids(config.include_thread_ids()),
                )
                .try_init()
                .context("Failed to initialize tracing subscriber")?;
        }
    }

    Ok(TracingGuard { _private: () })
}
