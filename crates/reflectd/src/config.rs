//! Daemon configuration
//!
//! Loaded from a TOML file; every field except `addr` has a default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use refcol_gateway::{ConnectorOptions, GatewayOptions};
use refcol_server::ServerOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// File name looked up in the configuration directory
pub const CONFIG_FILE_NAME: &str = "reflection.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Main gRPC listen address
    pub addr: String,

    /// Gateway identity, used for the health service name
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub disable_health: bool,

    #[serde(default = "default_health_addr")]
    pub health_addr: String,

    /// Auxiliary HTTP status endpoint, off when absent
    #[serde(default)]
    pub http_addr: Option<String>,

    #[serde(default)]
    pub enable_cache: bool,

    #[serde(default)]
    pub cache_max_entries: Option<usize>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Service names hidden from merged listings
    #[serde(default)]
    pub ignores: Vec<String>,

    /// Backend name -> `grpc[s]://host[:port][/prefix]`
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

fn default_name() -> String {
    "reflection".to_string()
}

fn default_health_addr() -> String {
    "localhost:9000".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_backend_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    10
}

/// Path of the configuration file: `explicit` if given, else
/// `<config_dir>/reflection.toml`.
pub fn config_path(explicit: Option<&Path>, config_dir: &Path) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => config_dir.join(CONFIG_FILE_NAME),
    }
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::Invalid("addr must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if !self.disable_health && self.health_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "health_addr must not be empty unless disable_health is set".to_string(),
            ));
        }
        for (field, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("backend_timeout_secs", self.backend_timeout_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", field)));
            }
        }
        if self.cache_max_entries == Some(0) {
            return Err(ConfigError::Invalid(
                "cache_max_entries must be positive when set".to_string(),
            ));
        }
        if let Some(name) = self.services.keys().find(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "service name {:?} must not be empty",
                name
            )));
        }
        Ok(())
    }

    /// Log the effective configuration
    pub fn log(&self) {
        info!(
            addr = %self.addr,
            name = %self.name,
            health = !self.disable_health,
            health_addr = %self.health_addr,
            http_addr = ?self.http_addr,
            cache = self.enable_cache,
            cache_max_entries = ?self.cache_max_entries,
            ignores = ?self.ignores,
            "Loaded configuration"
        );
        for (name, address) in &self.services {
            info!(backend = %name, address = %address, "Configured backend");
        }
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            enable_cache: self.enable_cache,
            cache_max_entries: self.cache_max_entries,
            connector: ConnectorOptions {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                call_timeout: Some(Duration::from_secs(self.backend_timeout_secs)),
            },
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            name: self.name.clone(),
            health_enabled: !self.disable_health,
            health_addr: self.health_addr.clone(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config("addr = \"0.0.0.0:8080\"\n");
        let config = GatewayConfig::load(file.path()).unwrap();

        assert_eq!(config.name, "reflection");
        assert_eq!(config.health_addr, "localhost:9000");
        assert!(!config.disable_health);
        assert!(!config.enable_cache);
        assert!(config.http_addr.is_none());
        assert!(config.services.is_empty());

        let server = config.server_options();
        assert!(server.health_enabled);
        assert_eq!(server.shutdown_timeout, Duration::from_secs(10));

        let gateway = config.gateway_options();
        assert_eq!(gateway.connector.connect_timeout, Duration::from_secs(5));
        assert_eq!(gateway.connector.call_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn full_config_parses() {
        let file = write_config(
            r#"
addr = "0.0.0.0:8080"
name = "edge"
disable_health = true
http_addr = "127.0.0.1:8081"
enable_cache = true
cache_max_entries = 100
ignores = ["grpc.health.v1.Health"]

[services]
orders = "grpc://orders.internal:50051"
billing = "grpcs://edge.internal:443/billing"
"#,
        );
        let config = GatewayConfig::load(file.path()).unwrap();

        assert_eq!(config.name, "edge");
        assert_eq!(config.http_addr.as_deref(), Some("127.0.0.1:8081"));
        assert_eq!(config.ignores, vec!["grpc.health.v1.Health".to_string()]);
        assert_eq!(
            config.services.keys().cloned().collect::<Vec<_>>(),
            vec!["billing".to_string(), "orders".to_string()]
        );

        let options = config.gateway_options();
        assert!(options.enable_cache);
        assert_eq!(options.cache_max_entries, Some(100));
        assert!(!config.server_options().health_enabled);
    }

    #[test]
    fn missing_addr_is_a_parse_error() {
        let file = write_config("name = \"edge\"\n");
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let file = write_config("addr = \":8080\"\nbackend_timeout_secs = 0\n");
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("backend_timeout_secs"));
    }

    #[test]
    fn empty_service_name_is_rejected() {
        let file = write_config("addr = \":8080\"\n[services]\n\"\" = \"grpc://a:1\"\n");
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = GatewayConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn explicit_path_wins_over_directory() {
        let dir = Path::new("configs/");
        assert_eq!(
            config_path(None, dir),
            PathBuf::from("configs/reflection.toml")
        );
        assert_eq!(
            config_path(Some(Path::new("/etc/gw.toml")), dir),
            PathBuf::from("/etc/gw.toml")
        );
    }
}
