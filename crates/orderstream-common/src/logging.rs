//! Logging configuration and initialization
//!
//! One subscriber setup for every orderstream binary: console and/or a daily
//! rotated file, text or JSON lines, with the level and per-module directives
//! overridable from `LOG_*` variables.
//!
//! Library code logs through `tracing` macros with structured fields
//! (`info!(worker_id, channel = %name, "Channel opened")`) and never prints.
//!
//! # Example
//!
//! ```no_run
//! use orderstream_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::for_binary("orderstream-ingest").merge_env()?;
//!     let _guard = init_logging(&config)?;
//!
//!     info!("Application started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSinks {
    pub console: bool,
    pub file: bool,
}

impl LogSinks {
    pub const CONSOLE: Self = Self {
        console: true,
        file: false,
    };

    /// `console`, `file` or `both`
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::CONSOLE),
            "file" => Ok(Self {
                console: false,
                file: true,
            }),
            "both" => Ok(Self {
                console: true,
                file: true,
            }),
            other => Err(anyhow!("Invalid log output: {}", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub sinks: LogSinks,

    /// JSON lines instead of human readable text
    pub json: bool,

    /// Directory for log files, only used when the file sink is on
    pub log_dir: PathBuf,

    /// "orderstream-ingest" -> "orderstream-ingest.2026-01-18"
    pub log_file_prefix: String,

    /// Extra directives, e.g. "sqlx=warn,orderstream_ingest=debug"
    pub filter_directives: Option<String>,

    /// Thread ids help tell concurrent worker tasks apart in file output
    pub include_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_binary("orderstream")
    }
}

impl LogConfig {
    /// Console text at info, files named after the binary
    pub fn for_binary(name: &str) -> Self {
        Self {
            level: Level::INFO,
            sinks: LogSinks::CONSOLE,
            json: false,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: name.to_string(),
            filter_directives: None,
            include_thread_ids: false,
        }
    }

    /// `--verbose` switches to debug; quiet keeps whatever level is set
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.level = Level::DEBUG;
        }
        self
    }

    /// Overlay `LOG_*` environment variables on top of `self`
    ///
    /// `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX`,
    /// `LOG_FILTER` and `LOG_THREAD_IDS`.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_value("LOG_LEVEL") {
            self.level = level
                .parse()
                .map_err(|_| anyhow!("Invalid log level: {}", level))?;
        }
        if let Some(output) = env_value("LOG_OUTPUT") {
            self.sinks = LogSinks::parse(&output)?;
        }
        if let Some(format) = env_value("LOG_FORMAT") {
            self.json = match format.to_lowercase().as_str() {
                "json" => true,
                "text" | "pretty" => false,
                _ => return Err(anyhow!("Invalid log format: {}", format)),
            };
        }
        if let Some(dir) = env_value("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env_value("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = env_value("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Some(val) = env_value("LOG_THREAD_IDS") {
            self.include_thread_ids = val
                .parse()
                .with_context(|| format!("LOG_THREAD_IDS must be true or false, got {val}"))?;
        }
        Ok(self)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Keeps the non-blocking file writer alive; drop it at process exit to flush
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_thread_ids(config.include_thread_ids)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(ansi);

    if config.json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let directives = config.filter_directives.as_deref().unwrap_or_default();
    for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        let parsed = directive
            .parse()
            .with_context(|| format!("Failed to parse filter directive {directive}"))?;
        filter = filter.add_directive(parsed);
    }

    Ok(filter)
}

/// Install the global subscriber; call once at startup
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = env_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.sinks.console {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.sinks.file {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        layers.push(fmt_layer(config, writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
