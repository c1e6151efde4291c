/// Configuration management for pasarela

use crate::auth::{Lock, Role};
use crate::core::{
    AwsMetadata, CommandLabel, Database, PROTOCOL_MONGODB, PROTOCOL_MYSQL, PROTOCOL_POSTGRES,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main pasarela configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Client-facing TLS configuration
    pub tls: TlsConfig,
    /// Heartbeat timings
    #[serde(default)]
    pub heartbeat: AnnounceConfig,
    /// Session monitoring
    #[serde(default)]
    pub session: SessionConfig,
    /// Proxied databases
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    /// Roles granting database access
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Trusted remote clusters
    #[serde(default)]
    pub trusted_clusters: Vec<TrustedClusterConfig>,
    /// Locks in force at startup
    #[serde(default)]
    pub locks: Vec<Lock>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique id of this gateway host
    pub host_id: String,
    /// Hostname reported in heartbeats
    pub hostname: String,
    /// Name of the local cluster
    pub cluster_name: String,
    /// Address to listen on
    pub listen_addr: String,
    /// Directory for cached CA bundles, heartbeats and session recordings
    pub data_dir: String,
}

/// TLS configuration, all files PEM encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    /// CA bundle client certificates must chain to
    pub client_ca_file: String,
}

/// Heartbeat timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceConfig {
    /// Announcement time-to-live in seconds
    pub server_ttl_sec: u64,
    /// Keep-alive interval in seconds
    pub keep_alive_sec: u64,
    /// Tick interval in seconds
    pub check_period_sec: u64,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            server_ttl_sec: 600,
            keep_alive_sec: 60,
            check_period_sec: 5,
        }
    }
}

impl AnnounceConfig {
    pub fn server_ttl(&self) -> Duration {
        Duration::from_secs(self.server_ttl_sec)
    }

    pub fn keep_alive_period(&self) -> Duration {
        Duration::from_secs(self.keep_alive_sec)
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_sec)
    }
}

/// Session monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout in seconds, 0 disables it
    pub client_idle_timeout_sec: u64,
    /// Interval between monitor checks in milliseconds
    pub monitor_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_idle_timeout_sec: 0,
            monitor_interval_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_sec)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// One proxied database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub protocol: String,
    pub uri: String,
    #[serde(default)]
    pub static_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub dynamic_labels: BTreeMap<String, CommandLabel>,
    /// PEM CA of the backend's server certificate
    #[serde(default)]
    pub ca_cert_file: Option<String>,
    #[serde(default)]
    pub aws: Option<AwsMetadata>,
}

impl DatabaseConfig {
    /// Build the database descriptor, reading the CA file if configured
    pub fn to_database(&self) -> Result<Database, ConfigError> {
        let ca_cert = match &self.ca_cert_file {
            Some(path) => Some(fs::read_to_string(path).map_err(|e| {
                ConfigError::IoError(format!("failed to read CA of {}: {}", self.name, e))
            })?),
            None => None,
        };
        Ok(Database {
            name: self.name.clone(),
            description: self.description.clone(),
            protocol: self.protocol.clone(),
            uri: self.uri.clone(),
            static_labels: self.static_labels.clone(),
            dynamic_labels: self.dynamic_labels.clone(),
            ca_cert,
            aws: self.aws.clone(),
        })
    }
}

/// Remote cluster whose users may connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedClusterConfig {
    pub name: String,
    /// CA bundle the remote cluster signs its users' certificates with
    pub ca_file: String,
    /// Remote role to local role; `*` maps every remote role
    pub role_map: HashMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "dev".to_string());
        Self {
            server: ServerConfig {
                host_id: "gateway-1".to_string(),
                hostname: "localhost".to_string(),
                cluster_name: "local".to_string(),
                listen_addr: "0.0.0.0:3080".to_string(),
                data_dir: "/var/lib/pasarela".to_string(),
            },
            tls: TlsConfig {
                cert_file: "/etc/pasarela/server.crt".to_string(),
                key_file: "/etc/pasarela/server.key".to_string(),
                client_ca_file: "/etc/pasarela/client-ca.crt".to_string(),
            },
            heartbeat: AnnounceConfig::default(),
            session: SessionConfig::default(),
            databases: vec![DatabaseConfig {
                name: "postgres-dev".to_string(),
                description: "Development PostgreSQL".to_string(),
                protocol: PROTOCOL_POSTGRES.to_string(),
                uri: "127.0.0.1:5432".to_string(),
                static_labels: labels.clone(),
                dynamic_labels: BTreeMap::new(),
                ca_cert_file: None,
                aws: None,
            }],
            roles: vec![Role {
                name: "dev".to_string(),
                db_names: vec!["*".to_string()],
                db_users: vec!["*".to_string()],
                db_labels: labels,
                client_idle_timeout_sec: None,
            }],
            trusted_clusters: Vec::new(),
            locks: Vec::new(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server config
        for (field, value) in [
            ("host_id", &self.server.host_id),
            ("hostname", &self.server.hostname),
            ("cluster_name", &self.server.cluster_name),
            ("data_dir", &self.server.data_dir),
        ] {
            if value.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "server.{} cannot be empty",
                    field
                )));
            }
        }

        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen address: {}",
                    self.server.listen_addr
                ))
            })?;

        // Validate heartbeat config
        let hb = &self.heartbeat;
        if hb.server_ttl_sec == 0 || hb.keep_alive_sec == 0 || hb.check_period_sec == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat periods must be greater than 0".to_string(),
            ));
        }

        if hb.keep_alive_sec >= hb.server_ttl_sec || hb.check_period_sec >= hb.server_ttl_sec {
            return Err(ConfigError::ValidationError(
                "heartbeat keep_alive_sec and check_period_sec must be less than server_ttl_sec"
                    .to_string(),
            ));
        }

        if self.session.monitor_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "session monitor_interval_ms must be greater than 0".to_string(),
            ));
        }

        // Validate databases
        if self.databases.is_empty() {
            return Err(ConfigError::ValidationError(
                "databases cannot be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for db in &self.databases {
            if db.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "database name cannot be empty".to_string(),
                ));
            }
            if !names.insert(db.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate database name: {}",
                    db.name
                )));
            }
            match db.protocol.as_str() {
                PROTOCOL_POSTGRES | PROTOCOL_MYSQL | PROTOCOL_MONGODB => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Unsupported protocol {} for database {}",
                        other, db.name
                    )))
                }
            }
            if db.uri.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "uri of database {} cannot be empty",
                    db.name
                )));
            }
            for (key, label) in &db.dynamic_labels {
                if label.command.is_empty() || label.period.is_zero() {
                    return Err(ConfigError::ValidationError(format!(
                        "dynamic label {} of database {} needs a command and a period",
                        key, db.name
                    )));
                }
            }
        }

        // Validate roles
        let mut roles = HashSet::new();
        for role in &self.roles {
            if !roles.insert(role.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate role name: {}",
                    role.name
                )));
            }
        }

        for cluster in &self.trusted_clusters {
            if cluster.name == self.server.cluster_name {
                return Err(ConfigError::ValidationError(format!(
                    "Trusted cluster {} cannot be the local cluster",
                    cluster.name
                )));
            }
            if cluster.ca_file.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Trusted cluster {} has no CA file",
                    cluster.name
                )));
            }
            for local in cluster.role_map.values() {
                if !roles.contains(local.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Trusted cluster {} maps to unknown role {}",
                        cluster.name, local
                    )));
                }
            }
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Trusted cluster role maps keyed by cluster name
    pub fn trusted_cluster_maps(&self) -> HashMap<String, HashMap<String, String>> {
        self.trusted_clusters
            .iter()
            .map(|c| (c.name.clone(), c.role_map.clone()))
            .collect()
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        Config::default().save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.server.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
        config.server.listen_addr = "127.0.0.1:3080".to_string();
        assert!(config.validate().is_ok());

        config.heartbeat.keep_alive_sec = config.heartbeat.server_ttl_sec;
        assert!(config.validate().is_err());
        config.heartbeat = AnnounceConfig::default();

        config.databases[0].protocol = "oracle".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_database_names_rejected() {
        let mut config = Config::default();
        let duplicate = config.databases[0].clone();
        config.databases.push(duplicate);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate database name"));
    }

    #[test]
    fn test_trusted_cluster_needs_ca_and_known_roles() {
        let mut config = Config::default();
        let mut role_map = HashMap::new();
        role_map.insert("admin".to_string(), "missing".to_string());
        config.trusted_clusters.push(TrustedClusterConfig {
            name: "leaf".to_string(),
            ca_file: String::new(),
            role_map,
        });
        assert!(config.validate().is_err());

        config.trusted_clusters[0].ca_file = "/etc/pasarela/leaf-ca.crt".to_string();
        assert!(config.validate().is_err());

        config.trusted_clusters[0]
            .role_map
            .insert("admin".to_string(), "dev".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.trusted_cluster_maps()["leaf"]["admin"], "dev");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_parse_dynamic_labels_and_locks() {
        let toml_str = r#"
            [server]
            host_id = "gw-1"
            hostname = "gw"
            cluster_name = "root"
            listen_addr = "127.0.0.1:3080"
            data_dir = "/tmp/pasarela"

            [tls]
            cert_file = "server.crt"
            key_file = "server.key"
            client_ca_file = "ca.crt"

            [[databases]]
            name = "pg1"
            protocol = "postgres"
            uri = "localhost:5432"

            [databases.dynamic_labels.host]
            period = 60
            command = ["hostname"]

            [[locks]]
            name = "lock-bob"
            message = "left the company"
            target = { user = "bob" }

            [logging]
            level = "debug"
            format = "json"
            stdout = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.databases[0].dynamic_labels["host"].period,
            Duration::from_secs(60)
        );
        assert_eq!(config.locks[0].target.user.as_deref(), Some("bob"));
        assert_eq!(config.heartbeat.server_ttl_sec, 600);
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        // Test save and load
        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());

        let database = loaded_config.databases[0].to_database().unwrap();
        assert_eq!(database.name, "postgres-dev");
        assert!(database.ca_cert.is_none());
    }

    #[test]
    fn test_database_ca_file_is_read() {
        let ca_file = NamedTempFile::new().unwrap();
        std::fs::write(ca_file.path(), "-----BEGIN CERTIFICATE-----\n").unwrap();

        let mut db = Config::default().databases[0].clone();
        db.ca_cert_file = Some(ca_file.path().display().to_string());
        assert!(db.to_database().unwrap().ca_cert.is_some());

        db.ca_cert_file = Some("/nonexistent/ca.pem".to_string());
        assert!(db.to_database().is_err());
    }
}
