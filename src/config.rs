//! Server configuration.
//!
//! The configuration is a single JSON document loaded once at startup by the
//! manager and re-read by each worker (workers also re-read it when a module is
//! reloaded, so module settings can change without a restart).
//!
//! ```json
//! {
//!   "server_name": "kim-gate",
//!   "worker_cnt": 3,
//!   "log_path": "log/kim.log",
//!   "log_level": "info",
//!   "modules": [{ "name": "test", "backend": "cache" }],
//!   "backends": {
//!     "cache": { "host": "127.0.0.1", "port": 6379, "max_conn_cnt": 2 }
//!   }
//! }
//! ```

use crate::backend::{BackendTarget, MuxSettings};
use crate::error::{KimError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration filename, resolved against the working directory.
pub const DEFAULT_CONFIG_FILENAME: &str = "config.json";

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name used for process titles, worker names and log messages.
    pub server_name: String,
    /// Number of worker processes to keep alive.
    #[serde(default = "default_worker_cnt")]
    pub worker_cnt: usize,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub node_host: String,
    #[serde(default)]
    pub node_port: u16,
    /// Log file, relative to the working directory unless absolute.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Period of the restart tick that respawns dead workers.
    #[serde(default = "default_restart_interval_ms")]
    pub restart_interval_ms: u64,
    /// How long shutdown waits for workers before killing them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Modules each worker loads, in dispatch-fallback order.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Backend targets by logical name.
    #[serde(default, alias = "redis")]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub backend_timeouts: BackendTimeouts,
}

/// One entry of the `modules` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Everything else in the entry is handed to the module untouched.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// Address and pool size of one backend target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_conn_cnt")]
    pub max_conn_cnt: usize,
}

/// Timeouts shared by every backend connection of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTimeouts {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    /// Idle connections are closed after this many seconds; 0 keeps them forever.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            command_ms: default_command_ms(),
            idle_secs: default_idle_secs(),
        }
    }
}

fn default_worker_cnt() -> usize {
    1
}

fn default_log_path() -> PathBuf {
    PathBuf::from("log/kim.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_restart_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_max_conn_cnt() -> usize {
    1
}

fn default_connect_ms() -> u64 {
    3000
}

fn default_command_ms() -> u64 {
    3000
}

fn default_idle_secs() -> u64 {
    60
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            KimError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let config = Self::from_json(&text)
            .map_err(|e| KimError::Config(format!("'{}': {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(KimError::Config("server_name must not be empty".into()));
        }
        if self.restart_interval_ms == 0 {
            return Err(KimError::Config(
                "restart_interval_ms must be greater than 0".into(),
            ));
        }
        for (name, backend) in &self.backends {
            if backend.max_conn_cnt == 0 {
                return Err(KimError::Config(format!(
                    "backend '{}': max_conn_cnt must be at least 1",
                    name
                )));
            }
            if backend.port == 0 {
                return Err(KimError::Config(format!(
                    "backend '{}': port must not be 0",
                    name
                )));
            }
        }
        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module.name.as_str()) {
                return Err(KimError::Config(format!(
                    "module '{}' is listed twice",
                    module.name
                )));
            }
        }
        Ok(())
    }

    /// Name of the worker occupying `index`.
    pub fn worker_name(&self, index: usize) -> String {
        format!("{}_w_{}", self.server_name, index)
    }

    /// Settings of the named module, if it is configured.
    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Backend targets in a form the multiplexer consumes.
    pub fn backend_targets(&self) -> Vec<BackendTarget> {
        self.backends
            .iter()
            .map(|(name, b)| BackendTarget {
                name: name.clone(),
                host: b.host.clone(),
                port: b.port,
                max_conn_cnt: b.max_conn_cnt,
            })
            .collect()
    }

    /// Multiplexer timeouts.
    pub fn mux_settings(&self) -> MuxSettings {
        let t = &self.backend_timeouts;
        MuxSettings {
            connect_timeout: Duration::from_millis(t.connect_ms),
            command_timeout: Duration::from_millis(t.command_ms),
            idle_timeout: (t.idle_secs > 0).then(|| Duration::from_secs(t.idle_secs)),
        }
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Log file resolved against `work_dir`.
    pub fn log_file(&self, work_dir: &Path) -> PathBuf {
        if self.log_path.is_absolute() {
            self.log_path.clone()
        } else {
            work_dir.join(&self.log_path)
        }
    }
}

/// Resolve the configuration path, defaulting to `config.json` in the working directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => PathBuf::from(DEFAULT_CONFIG_FILENAME),
    };
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "server_name": "kim-gate",
        "worker_cnt": 3,
        "node_host": "127.0.0.1",
        "node_port": 3355,
        "modules": [{ "name": "test", "backend": "cache" }],
        "redis": {
            "cache": { "host": "127.0.0.1", "port": 6379, "max_conn_cnt": 2 }
        },
        "backend_timeouts": { "command_ms": 500, "idle_secs": 0 }
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.server_name, "kim-gate");
        assert_eq!(config.worker_cnt, 3);
        assert_eq!(config.node_port, 3355);
        assert_eq!(config.restart_interval_ms, 1000);
        assert_eq!(config.log_level, "info");

        let targets = config.backend_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "cache");
        assert_eq!(targets[0].max_conn_cnt, 2);

        let module = config.module("test").unwrap();
        assert_eq!(module.settings["backend"], "cache");
    }

    #[test]
    fn test_mux_settings() {
        let config = Config::from_json(SAMPLE).unwrap();
        let settings = config.mux_settings();
        assert_eq!(settings.command_timeout, Duration::from_millis(500));
        assert_eq!(settings.connect_timeout, Duration::from_millis(3000));
        assert!(settings.idle_timeout.is_none());
    }

    #[test]
    fn test_worker_name() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.worker_name(2), "kim-gate_w_2");
    }

    #[test]
    fn test_rejects_empty_server_name() {
        let err = Config::from_json(r#"{ "server_name": "  " }"#).unwrap_err();
        assert!(err.to_string().contains("server_name"));
    }

    #[test]
    fn test_rejects_zero_connection_cap() {
        let text = r#"{
            "server_name": "s",
            "backends": { "cache": { "host": "h", "port": 1, "max_conn_cnt": 0 } }
        }"#;
        let err = Config::from_json(text).unwrap_err();
        assert!(err.to_string().contains("max_conn_cnt"));
    }

    #[test]
    fn test_rejects_duplicate_modules() {
        let text = r#"{ "server_name": "s", "modules": [{ "name": "a" }, { "name": "a" }] }"#;
        let err = Config::from_json(text).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.worker_cnt, 3);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/kim.json")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn test_log_file_resolution() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(
            config.log_file(Path::new("/srv/kim")),
            PathBuf::from("/srv/kim/log/kim.log")
        );
    }
}
