use crate::build_info;
use crate::redaction::redact_secrets;
use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for runtime logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    /// Parses a `LOG_FORMAT` value. Anything unrecognized falls back to `json`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Self::Text,
            _ => Self::Json,
        }
    }

    fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

/// Common context attached to the bootstrap event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    pub service: String,
    pub mode: String,
    pub environment: String,
    pub run_id: String,
    pub build_version: String,
    pub build_commit: String,
    pub format: LogFormat,
}

/// Installs the process-wide subscriber and emits `logging_initialized`.
///
/// `log` records are bridged into `tracing`. `RUST_LOG` remains the per-target filter knob and
/// `default_level` applies when it is unset.
pub fn init_logging(service: &str, mode: &str, default_level: &str) -> LoggingContext {
    let context = LoggingContext {
        service: service.to_string(),
        mode: mode.to_string(),
        environment: std::env::var("APP_ENV")
            .or_else(|_| std::env::var("ENVIRONMENT"))
            .unwrap_or_else(|_| "dev".to_string()),
        run_id: build_run_id(service),
        build_version: build_info::VERSION.to_string(),
        build_commit: build_info::short_commit_hash().to_string(),
        format: LogFormat::from_env(),
    };

    install_subscriber(context.format, default_level);

    tracing::info!(
        event = "logging_initialized",
        service = %context.service,
        environment = %context.environment,
        mode = %context.mode,
        run_id = %context.run_id,
        build_version = %context.build_version,
        build_commit = %context.build_commit,
        log_format = context.format.as_str(),
        "initialized logging"
    );

    context
}

fn install_subscriber(format: LogFormat, default_level: &str) {
    let _ = LogTracer::init();

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(default_env_filter(default_level))
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(default_env_filter(default_level))
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };

    let _ = result;
}

fn default_env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn build_run_id(service: &str) -> String {
    let epoch_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or_default();
    format!("{service}-{}-{epoch_millis}", process::id())
}

/// Builds a multi-line report with the error, its full source chain and a backtrace.
///
/// Used at process boundaries. Upstream errors often embed request URLs, so every line goes
/// through the secret redactor before it is returned.
pub fn format_error_report(err: &(dyn StdError + 'static)) -> String {
    let mut report = String::new();
    report.push_str("error: ");
    report.push_str(&err.to_string());

    let mut current_source = err.source();
    let mut source_index = 1usize;
    while let Some(source) = current_source {
        report.push_str("\ncaused by (");
        report.push_str(&source_index.to_string());
        report.push_str("): ");
        report.push_str(&source.to_string());
        current_source = source.source();
        source_index = source_index.saturating_add(1);
    }

    report.push_str("\nbacktrace:\n");
    report.push_str(&Backtrace::force_capture().to_string());
    redact_secrets(&report)
}
