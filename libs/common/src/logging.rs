//! Unified logging module for the gateway services
//!
//! Console output always uses the bracketed-level format; an optional daily
//! rolling file sink is added when a log directory is configured.

use std::path::PathBuf;

use errors::{GatewayError, GatewayResult};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
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

/// Event formatter that outputs: `timestamp [LEVEL] message key=value...`
///
/// Example output: `2026-10-16T00:50:44.809123Z [WARN] Device disabled device_id="meter-3"`
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

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and the default debug target
    pub service_name: String,
    /// Default filter level when `RUST_LOG` is not set
    pub level: String,
    /// Directory for daily rolling log files; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// Emit ANSI colours on the console
    pub ansi: bool,
    /// Write the file sink as JSON lines
    pub json_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            ansi: true,
            json_file: false,
        }
    }
}

impl LogConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Build the filter directive string.
    ///
    /// `RUST_LOG` wins when present; otherwise the configured level applies
    /// globally and the service's own target is raised to at least `debug`
    /// only when the configured level is already `debug` or `trace`.
    pub fn filter_directive(&self, rust_log: Option<&str>) -> String {
        if let Some(env) = rust_log.filter(|s| !s.trim().is_empty()) {
            return env.to_string();
        }
        let level = self.level.to_lowercase();
        match level.as_str() {
            "trace" | "debug" => format!("{},{}={}", level, self.service_name, level),
            "info" | "warn" | "error" | "off" => level,
            _ => "info".to_string(),
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Keeps the non-blocking file writer alive and allows runtime level changes.
///
/// Dropping the guard flushes and stops the file writer thread.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
    filter: FilterHandle,
}

impl LogGuard {
    /// Dynamically set the log filter (e.g. `"debug"` or `"info,pollsrv=trace"`)
    pub fn set_level(&self, directive: &str) -> GatewayResult<()> {
        let new_filter = EnvFilter::try_new(directive).map_err(|e| GatewayError::InvalidConfig {
            field: "log_level".to_string(),
            reason: e.to_string(),
        })?;
        self.filter
            .reload(new_filter)
            .map_err(|e| GatewayError::Internal(format!("Failed to reload log filter: {}", e)))?;
        tracing::info!("Log level changed to: {}", directive);
        Ok(())
    }
}

/// Initialize the global subscriber.
///
/// Must be called once per process; a second call fails because the global
/// default subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> GatewayResult<LogGuard> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = config.filter_directive(rust_log.as_deref());
    let env_filter = EnvFilter::try_new(&directive).map_err(|e| GatewayError::InvalidConfig {
        field: "log_level".to_string(),
        reason: e.to_string(),
    })?;
    let (reload_filter, filter) = reload::Layer::new(env_filter);

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.json_file {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
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
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| GatewayError::StartupFailed(format!("Logging already initialised: {}", e)))?;

    tracing::info!(
        "Logging: {} @ {} (filter: {})",
        config.service_name,
        config
            .log_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "console".to_string()),
        directive
    );

    Ok(LogGuard {
        _file_guard: file_guard,
        filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_takes_priority() {
        let config = LogConfig::new("pollsrv");
        assert_eq!(
            config.filter_directive(Some("warn,pollsrv::pool=trace")),
            "warn,pollsrv::pool=trace"
        );
    }

    #[test]
    fn test_blank_rust_log_is_ignored() {
        let config = LogConfig::new("pollsrv");
        assert_eq!(config.filter_directive(Some("  ")), "info");
    }

    #[test]
    fn test_debug_level_targets_service() {
        let config = LogConfig {
            level: "DEBUG".to_string(),
            ..LogConfig::new("pollsrv")
        };
        assert_eq!(config.filter_directive(None), "debug,pollsrv=debug");
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let config = LogConfig {
            level: "verbose".to_string(),
            ..LogConfig::new("pollsrv")
        };
        assert_eq!(config.filter_directive(None), "info");
    }

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::TRACE), "[TRACE]");
    }
}
