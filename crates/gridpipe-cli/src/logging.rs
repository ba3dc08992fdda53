//! Logging setup for the gridpipe binary.
//!
//! The level comes from `RUST_LOG` when set, otherwise from `--log-level`.
//! Format and destination come from the environment:
//! - `GRIDPIPE_LOG_FORMAT`: "pretty" (default) or "json"
//! - `GRIDPIPE_LOG_OUTPUT`: "stdout" (default) or "file"
//! - `GRIDPIPE_LOG_DIR`: directory for rolling log files (default "./logs")
//!
//! Only the binary installs a subscriber; library crates emit events and
//! stay silent on their own.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable console lines.
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("GRIDPIPE_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    /// Daily-rolling files under `GRIDPIPE_LOG_DIR`.
    File,
}

impl LogOutput {
    pub fn from_env() -> Self {
        match std::env::var("GRIDPIPE_LOG_OUTPUT").as_deref() {
            Ok("file") => LogOutput::File,
            _ => LogOutput::Stdout,
        }
    }
}

pub fn init(log_level: &str) {
    let format = LogFormat::from_env();
    let output = LogOutput::from_env();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        // Quiet the HTTP transport unless asked for explicitly.
        .add_directive("ureq=warn".parse().unwrap())
        .add_directive("rustls=warn".parse().unwrap());

    match (output, format) {
        (LogOutput::Stdout, LogFormat::Pretty) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false))
                .init();
        }
        (LogOutput::Stdout, LogFormat::Json) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_current_span(true))
                .init();
        }
        (LogOutput::File, format) => {
            let log_dir =
                std::env::var("GRIDPIPE_LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
            std::fs::create_dir_all(&log_dir).ok();
            let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "gridpipe.log");

            match format {
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(appender).with_ansi(false))
                        .init();
                }
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(
                            fmt::layer()
                                .json()
                                .with_current_span(true)
                                .with_writer(appender)
                                .with_ansi(false),
                        )
                        .init();
                }
            }
        }
    }

    tracing::debug!(format = ?format, output = ?output, "logging initialized");
}
