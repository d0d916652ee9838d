//! Unified logging module for hub services
//!
//! Console output uses a compact `timestamp [LEVEL] message` format. A
//! daily-rolling file layer is added when a log directory is configured.

use std::path::PathBuf;

use errors::{HubError, HubResult};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::Writer,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Hub engine started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logger options
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Service name, used as the file prefix and the default debug target
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info")
    pub level: String,
    /// Emit ANSI colours on the console
    pub ansi: bool,
    /// Directory for daily-rolling log files; console only when `None`
    pub directory: Option<PathBuf>,
    /// JSON lines in the log file instead of the bracketed format
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            service_name: "hubsrv".to_string(),
            level: "info".to_string(),
            ansi: true,
            directory: None,
            json: false,
        }
    }
}

impl LogOptions {
    /// Filter string: `RUST_LOG` wins, otherwise the configured level
    fn filter_directive(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(env_str) if !env_str.trim().is_empty() => env_str,
            _ => self.level.clone(),
        }
    }
}

/// Initialize the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. It is `None` when no directory is configured.
pub fn init_logging(options: &LogOptions) -> HubResult<Option<WorkerGuard>> {
    let directive = options.filter_directive();
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| HubError::config(format!("Invalid log level '{}': {}", directive, e)))?;

    let console_layer = fmt::layer()
        .with_ansi(options.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, guard) = match &options.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", options.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = if options.json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| HubError::internal(format!("Logging already initialized: {}", e)))?;

    tracing::info!("Logging: {} @ {}", options.service_name, directive);
    if let Some(dir) = &options.directory {
        tracing::debug!("Log files under {:?}", dir);
    }

    Ok(guard)
}
