//! shardgate.toml configuration parser.
//!
//! The file carries two tables: `[backend]` with the global pool settings and
//! `[datasources.<name>]` with one entry per downstream node.
//!
//! ```toml
//! [backend]
//! max_connections = 8
//! connection_timeout_seconds = 5
//!
//! [datasources.ds_0]
//! host = "127.0.0.1"
//! port = 3306
//! schema = "demo_ds_0"
//! username = "root"
//! password = ""
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DataSourceDescriptor;

/// Errors raised while loading configuration or pulling descriptors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("descriptor source unreachable: {0}")]
    Unreachable(String),

    #[error("descriptor source returned no data sources")]
    NoDataSources,

    #[error("duplicate data source name: {0}")]
    DuplicateDataSource(String),
}

/// Which transport variant the backend may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Check the host and use the kernel-level variant when available.
    #[default]
    Auto,
    /// Always use the portable variant.
    Portable,
}

/// `[backend]` table as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSection {
    pub max_connections: Option<usize>,
    pub connection_timeout_seconds: Option<u64>,
    pub worker_threads: Option<usize>,
    pub shutdown_grace_seconds: Option<u64>,
    pub transport: Option<TransportPreference>,
    pub connect_timeout_ms: Option<u64>,
    pub allow_empty: Option<bool>,
}

/// `[datasources.<name>]` table as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceSection {
    pub host: String,
    pub port: u16,
    pub schema: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Overrides `backend.max_connections` for this data source only.
    pub max_connections: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub datasources: BTreeMap<String, DataSourceSection>,
}

impl ProxyConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.max_connections == Some(0) {
            return Err(ConfigError::Invalid(
                "backend.max_connections must be at least 1".to_string(),
            ));
        }
        if self.backend.worker_threads == Some(0) {
            return Err(ConfigError::Invalid(
                "backend.worker_threads must be at least 1".to_string(),
            ));
        }
        for (name, ds) in &self.datasources {
            if ds.host.is_empty() {
                return Err(ConfigError::Invalid(format!("datasources.{name}.host is empty")));
            }
            if ds.max_connections == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "datasources.{name}.max_connections must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Descriptors in name order.
    pub fn descriptors(&self) -> Vec<DataSourceDescriptor> {
        self.datasources
            .iter()
            .map(|(name, ds)| DataSourceDescriptor {
                name: name.clone(),
                host: ds.host.clone(),
                port: ds.port,
                schema: ds.schema.clone(),
                username: ds.username.clone(),
                password: ds.password.clone(),
            })
            .collect()
    }

    /// Resolve the `[backend]` table into runtime settings, filling defaults.
    pub fn backend_settings(&self) -> BackendSettings {
        let defaults = BackendSettings::default();
        let b = &self.backend;
        BackendSettings {
            max_connections: b.max_connections.unwrap_or(defaults.max_connections),
            connection_timeout: b
                .connection_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.connection_timeout),
            worker_threads: b.worker_threads.unwrap_or(defaults.worker_threads),
            shutdown_grace: b
                .shutdown_grace_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            transport: b.transport.unwrap_or_default(),
            connect_timeout: b.connect_timeout_ms.map(Duration::from_millis),
            allow_empty: b.allow_empty.unwrap_or(false),
            capacity_overrides: self
                .datasources
                .iter()
                .filter_map(|(name, ds)| ds.max_connections.map(|n| (name.clone(), n)))
                .collect(),
        }
    }
}

/// Process-wide backend settings, resolved from the `[backend]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    /// Pool capacity per data source (default: 8).
    pub max_connections: usize,
    /// Bound on every acquire, including establishing a new connection (default: 5s).
    pub connection_timeout: Duration,
    /// Worker threads driving backend socket I/O (default: CPU cores).
    pub worker_threads: usize,
    /// Grace period for checked-out connections on stop (default: 10s).
    pub shutdown_grace: Duration,
    pub transport: TransportPreference,
    /// Socket-level connect timeout for whichever transport is selected.
    /// `None` keeps that transport's own default (native 30s, portable 100ms).
    pub connect_timeout: Option<Duration>,
    /// Whether `start()` accepts a source with zero data sources.
    pub allow_empty: bool,
    /// Per-data-source capacity overrides.
    pub capacity_overrides: HashMap<String, usize>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            connection_timeout: Duration::from_secs(5),
            worker_threads: default_worker_threads(),
            shutdown_grace: Duration::from_secs(10),
            transport: TransportPreference::Auto,
            connect_timeout: None,
            allow_empty: false,
            capacity_overrides: HashMap::new(),
        }
    }
}

impl BackendSettings {
    /// Pool capacity for the named data source.
    pub fn capacity_for(&self, name: &str) -> usize {
        self.capacity_overrides
            .get(name)
            .copied()
            .unwrap_or(self.max_connections)
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[backend]
max_connections = 4
connection_timeout_seconds = 2
transport = "portable"
connect_timeout_ms = 250

[datasources.ds_0]
host = "10.0.0.1"
port = 3306
schema = "demo_ds_0"
username = "root"
password = "secret"

[datasources.ds_1]
host = "10.0.0.2"
port = 3307
schema = "demo_ds_1"
username = "root"
max_connections = 2
"#;

    #[test]
    fn parse_full_config() {
        let config = ProxyConfig::from_toml_str(SAMPLE).unwrap();
        let settings = config.backend_settings();
        assert_eq!(settings.max_connections, 4);
        assert_eq!(settings.connection_timeout, Duration::from_secs(2));
        assert_eq!(settings.transport, TransportPreference::Portable);
        assert_eq!(settings.connect_timeout, Some(Duration::from_millis(250)));
        assert_eq!(settings.capacity_for("ds_0"), 4);
        assert_eq!(settings.capacity_for("ds_1"), 2);
    }

    #[test]
    fn descriptors_are_name_ordered() {
        let config = ProxyConfig::from_toml_str(SAMPLE).unwrap();
        let names: Vec<_> = config.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["ds_0", "ds_1"]);
    }

    #[test]
    fn missing_password_defaults_to_empty() {
        let config = ProxyConfig::from_toml_str(SAMPLE).unwrap();
        let ds_1 = &config.descriptors()[1];
        assert_eq!(ds_1.password, "");
    }

    #[test]
    fn empty_backend_uses_defaults() {
        let config = ProxyConfig::from_toml_str("").unwrap();
        let settings = config.backend_settings();
        assert_eq!(settings.max_connections, 8);
        assert_eq!(settings.connection_timeout, Duration::from_secs(5));
        assert!(settings.worker_threads >= 1);
        assert!(!settings.allow_empty);
        assert!(config.descriptors().is_empty());
    }

    #[test]
    fn zero_max_connections_rejected() {
        let err = ProxyConfig::from_toml_str("[backend]\nmax_connections = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_transport_rejected() {
        let err = ProxyConfig::from_toml_str("[backend]\ntransport = \"carrier-pigeon\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn from_file_reads_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardgate.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ProxyConfig::from_file(&path).unwrap();
        assert_eq!(config.datasources.len(), 2);
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProxyConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
