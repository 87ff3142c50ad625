//! Logging setup shared by the manager and its workers.
//!
//! Every process logs to stderr and, when a log file is configured, to its own
//! file: the manager writes `<log_path>` and worker `N` writes
//! `<stem>_w<N>.<ext>` next to it, so no two processes ever append to the same
//! file.
//!
//! # Environment Variables
//!
//! - `KIM_LOG` - Log filter (overrides RUST_LOG)
//! - `KIM_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `KIM_LOG_FORMAT` - Output format: pretty, compact, json
//! - `KIM_LOG_FILE` - Path to log file (overrides the configured `log_path`)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::Config;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Log rotation for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Process label logged once at initialisation, e.g. `manager` or `kim_w_2`.
    pub process: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            filter: None,
            process: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the manager process: configured level, configured log file.
    pub fn for_manager(config: &Config, work_dir: &Path) -> Self {
        Self {
            level: parse_level(&config.log_level).unwrap_or(Level::INFO),
            file_path: Some(config.log_file(work_dir)),
            process: Some("manager".to_string()),
            ..Self::default()
        }
    }

    /// Preset for worker `index`: same level, per-worker log file.
    pub fn for_worker(config: &Config, work_dir: &Path, index: usize) -> Self {
        Self {
            level: parse_level(&config.log_level).unwrap_or(Level::INFO),
            file_path: Some(worker_log_file(&config.log_file(work_dir), index)),
            process: Some(config.worker_name(index)),
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Disable file output.
    pub fn without_file(mut self) -> Self {
        self.file_path = None;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI flags take precedence: an already-set filter is never replaced.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("KIM_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("KIM_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("KIM_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("KIM_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }
}

/// Per-worker log file derived from the manager's: `log/kim.log` -> `log/kim_w3.log`.
pub fn worker_log_file(manager_file: &Path, index: usize) -> PathBuf {
    let stem = manager_file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("kim");
    let name = match manager_file.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_w{}.{}", stem, index, ext),
        None => format!("{}_w{}", stem, index),
    };
    manager_file.with_file_name(name)
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_ansi(ansi).with_writer(writer).boxed(),
    }
}

/// Install the global subscriber.
///
/// Calling this more than once is harmless; later calls are ignored. If the
/// log directory cannot be created, logging continues on stderr only.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let mut layers: Vec<BoxedLayer> = vec![format_layer(config.format, std::io::stderr, true)];

    if let Some(path) = &config.file_path {
        let parent = path.parent().unwrap_or(Path::new("."));
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("kim.log");
        match std::fs::create_dir_all(parent) {
            Ok(()) => {
                let appender = RollingFileAppender::new(config.rotation.into(), parent, file_name);
                layers.push(format_layer(config.format, appender, false));
            }
            Err(e) => eprintln!(
                "Warning: cannot create log directory '{}': {}",
                parent.display(),
                e
            ),
        }
    }

    let result = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();

    if result.is_ok()
        && let Some(process) = &config.process
    {
        tracing::debug!(process = %process, pid = std::process::id(), "logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_worker_log_file() {
        assert_eq!(
            worker_log_file(Path::new("/srv/log/kim.log"), 3),
            PathBuf::from("/srv/log/kim_w3.log")
        );
        assert_eq!(
            worker_log_file(Path::new("log/server"), 1),
            PathBuf::from("log/server_w1")
        );
    }

    #[test]
    fn test_presets_follow_config() {
        let config = Config::from_json(
            r#"{ "server_name": "gate", "log_level": "debug", "log_path": "log/gate.log" }"#,
        )
        .unwrap();
        let manager = LogConfig::for_manager(&config, Path::new("/srv"));
        assert_eq!(manager.level, Level::DEBUG);
        assert_eq!(manager.file_path, Some(PathBuf::from("/srv/log/gate.log")));

        let worker = LogConfig::for_worker(&config, Path::new("/srv"), 2);
        assert_eq!(worker.file_path, Some(PathBuf::from("/srv/log/gate_w2.log")));
        assert_eq!(worker.process.as_deref(), Some("gate_w_2"));
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_level(Level::TRACE)
            .with_format(LogFormat::Json)
            .with_file(PathBuf::from("/tmp/kim.log"))
            .without_file()
            .with_filter("kim=debug".to_string());
        assert_eq!(config.level, Level::TRACE);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.file_path.is_none());
        assert_eq!(config.filter.as_deref(), Some("kim=debug"));
    }
}
