//! WolfMirror Configuration
//!
//! Configuration is loaded once by the command line layer and handed to the
//! replication engine as an immutable value. Nothing below the CLI reads the
//! process environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Endpoint schemes understood by the store connector
pub const KNOWN_SCHEMES: &[&str] = &["mongodb://", "mongodb+srv://", "memory://"];

/// Main WolfMirror configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MirrorConfig {
    /// Fan-out configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Driver-level hints passed to every replica connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Field normalization applied before dispatch
    #[serde(default)]
    pub sanitize: SanitizeConfig,

    /// Replica registry: target id -> endpoint URL
    #[serde(default)]
    pub replicas: BTreeMap<String, String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of replicas processed simultaneously
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Connection acquisition timeout in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Database name used on every replica
    #[serde(default = "default_database")]
    pub database: String,
}

/// Connection pool hints for the store driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,

    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,

    #[serde(default = "default_server_selection_timeout_ms")]
    pub server_selection_timeout_ms: u64,

    /// Socket-level connect timeout of the driver (distinct from the acquisition race)
    #[serde(default = "default_driver_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_heartbeat_frequency_ms")]
    pub heartbeat_frequency_ms: u64,

    #[serde(default = "default_true")]
    pub retry_writes: bool,

    #[serde(default)]
    pub retry_reads: bool,
}

/// Field normalization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeConfig {
    /// Field names whose values are coerced to strings at any depth
    #[serde(default = "default_sanitize_fields")]
    pub fields: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_max_concurrent() -> usize {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_database() -> String {
    "app".to_string()
}

fn default_max_pool_size() -> u32 {
    3
}

fn default_min_pool_size() -> u32 {
    1
}

fn default_max_idle_time_ms() -> u64 {
    30_000
}

fn default_server_selection_timeout_ms() -> u64 {
    5_000
}

fn default_driver_connect_timeout_ms() -> u64 {
    8_000
}

fn default_heartbeat_frequency_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_sanitize_fields() -> Vec<String> {
    vec!["Id_Aula".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            connect_timeout_ms: default_acquire_timeout_ms(),
            database: default_database(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            min_pool_size: default_min_pool_size(),
            max_idle_time_ms: default_max_idle_time_ms(),
            server_selection_timeout_ms: default_server_selection_timeout_ms(),
            connect_timeout_ms: default_driver_connect_timeout_ms(),
            heartbeat_frequency_ms: default_heartbeat_frequency_ms(),
            retry_writes: true,
            retry_reads: false,
        }
    }
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            fields: default_sanitize_fields(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl MirrorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.replication.max_concurrent == 0 {
            return Err(crate::Error::Config(
                "replication.max_concurrent must be at least 1".into(),
            ));
        }

        if self.replication.connect_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "replication.connect_timeout_ms must be at least 1".into(),
            ));
        }

        if self.replication.database.is_empty() {
            return Err(crate::Error::Config("replication.database cannot be empty".into()));
        }

        if self.store.min_pool_size > self.store.max_pool_size {
            return Err(crate::Error::Config(format!(
                "store.min_pool_size ({}) exceeds store.max_pool_size ({})",
                self.store.min_pool_size, self.store.max_pool_size
            )));
        }

        // A blank URL is left to resolve as unconfigured for that replica alone
        for (target, url) in self.replicas.iter().filter(|(_, url)| !url.trim().is_empty()) {
            if !KNOWN_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(crate::Error::Config(format!(
                    "replica {} has unsupported endpoint '{}'",
                    target, url
                )));
            }
        }

        Ok(())
    }

    /// Get the acquisition timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.connect_timeout_ms)
    }

    /// Sample configuration written by `wolfmirror init`
    pub fn sample() -> String {
        r#"# WolfMirror configuration

[replication]
# Replicas processed simultaneously; larger target lists run in batches
max_concurrent = 5
# Connection acquisition timeout
connect_timeout_ms = 10000
database = "app"

[store]
max_pool_size = 3
min_pool_size = 1
max_idle_time_ms = 30000
server_selection_timeout_ms = 5000
connect_timeout_ms = 8000
heartbeat_frequency_ms = 10000
retry_writes = true
retry_reads = false

[sanitize]
fields = ["Id_Aula"]

[replicas]
ins1 = "mongodb://127.0.0.1:27017"
ins2 = "memory://ins2"

[logging]
level = "info"
format = "pretty"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[replication]
max_concurrent = 3
connect_timeout_ms = 2500
database = "school"

[store]
max_pool_size = 4

[sanitize]
fields = ["Id_Aula", "Id_Curso"]

[replicas]
ins1 = "mongodb://10.0.0.1:27017"
ins2 = "memory://ins2"
"#;

        let config = MirrorConfig::from_str(toml).unwrap();
        assert_eq!(config.replication.max_concurrent, 3);
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(config.store.max_pool_size, 4);
        assert_eq!(config.store.min_pool_size, 1);
        assert_eq!(config.sanitize.fields.len(), 2);
        assert_eq!(config.replicas.len(), 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config = MirrorConfig::from_str("").unwrap();
        assert_eq!(config.replication.max_concurrent, 5);
        assert_eq!(config.replication.connect_timeout_ms, 10_000);
        assert!(config.store.retry_writes);
        assert!(!config.store.retry_reads);
        assert_eq!(config.sanitize.fields, vec!["Id_Aula".to_string()]);
        assert!(config.replicas.is_empty());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = MirrorConfig::from_str("[replication]\nmax_concurrent = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let err = MirrorConfig::from_str("[replicas]\nins1 = \"postgres://db\"\n").unwrap_err();
        assert!(err.to_string().contains("ins1"));
    }

    #[test]
    fn test_blank_endpoint_loads() {
        let toml = "[replicas]\nins1 = \"memory://ins1\"\nins2 = \"\"\n";
        let config = MirrorConfig::from_str(toml).unwrap();
        assert_eq!(config.replicas.get("ins2").map(String::as_str), Some(""));
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let toml = "[store]\nmax_pool_size = 1\nmin_pool_size = 2\n";
        assert!(MirrorConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_sample_is_valid() {
        let config = MirrorConfig::from_str(&MirrorConfig::sample()).unwrap();
        assert_eq!(config.replicas.len(), 2);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MirrorConfig::sample().as_bytes()).unwrap();

        let config = MirrorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.replication.database, "app");
    }
}
