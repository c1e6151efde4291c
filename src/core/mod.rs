/// Core resources shared by the gateway components: proxied database
/// descriptors, the heartbeat snapshot, CA rotation state, caller identity
/// and the per-connection session.
pub mod identity;
pub mod session;

pub use identity::{Identity, IdentityContext, RouteToDatabase, UserKind};
pub use session::{Session, StatementsCache};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Protocol identifiers understood by the default engine registry
pub const PROTOCOL_POSTGRES: &str = "postgres";
pub const PROTOCOL_MYSQL: &str = "mysql";
pub const PROTOCOL_MONGODB: &str = "mongodb";

/// A label whose value is produced by periodically running a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLabel {
    /// How often the command is re-run
    #[serde(with = "duration_secs")]
    pub period: Duration,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Output of the last successful run
    #[serde(default)]
    pub result: String,
}

impl CommandLabel {
    pub fn new(period: Duration, command: Vec<String>) -> Self {
        Self {
            period,
            command,
            result: String::new(),
        }
    }
}

/// Cloud hosting metadata for databases whose server certificates are
/// issued by a provider-managed CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsMetadata {
    pub region: String,
    pub kind: AwsDatabaseKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AwsDatabaseKind {
    Rds,
    Redshift,
}

/// Descriptor of one proxied backend database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Wire protocol spoken by the backend, e.g. `postgres`
    pub protocol: String,
    /// Backend address, either `host:port` or a URL such as `postgres://host:5432`
    pub uri: String,
    #[serde(default)]
    pub static_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub dynamic_labels: BTreeMap<String, CommandLabel>,
    /// PEM encoded CA used to verify the backend's server certificate
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub aws: Option<AwsMetadata>,
}

impl Database {
    pub fn new<S: Into<String>>(name: S, protocol: S, uri: S) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            protocol: protocol.into(),
            uri: uri.into(),
            static_labels: BTreeMap::new(),
            dynamic_labels: BTreeMap::new(),
            ca_cert: None,
            aws: None,
        }
    }

    /// Static labels merged with the latest dynamic label results.
    /// Dynamic values win on key collisions.
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.static_labels.clone();
        for (key, label) in &self.dynamic_labels {
            labels.insert(key.clone(), label.result.clone());
        }
        labels
    }

    /// Replace dynamic label definitions and results with a fresh snapshot
    pub fn set_dynamic_labels(&mut self, labels: BTreeMap<String, CommandLabel>) {
        self.dynamic_labels = labels;
    }

    /// Whether the backend certificate is issued by a cloud-managed CA that
    /// has to be downloaded because none was configured
    pub fn needs_cloud_ca(&self) -> bool {
        self.aws.is_some() && self.ca_cert.is_none()
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Database(name={}, protocol={}, uri={})", self.name, self.protocol, self.uri)
    }
}

/// Phase of certificate authority rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    #[default]
    Standby,
    Init,
    UpdateClients,
    UpdateServers,
    Rollback,
}

/// Certificate authority rotation state embedded in heartbeats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Rotation {
    pub phase: RotationPhase,
    #[serde(default)]
    pub current_id: String,
    #[serde(default)]
    pub started: Option<SystemTime>,
}

/// Point-in-time view of one proxied database as announced to the control
/// plane. Always an owned copy: building one never aliases live server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseServer {
    pub host_id: String,
    pub hostname: String,
    pub version: String,
    pub database: Database,
    pub rotation: Option<Rotation>,
    pub expiry: SystemTime,
}

impl DatabaseServer {
    pub fn name(&self) -> &str {
        &self.database.name
    }

    /// Compare everything except the expiry, which changes on every build.
    pub fn same_content(&self, other: &DatabaseServer) -> bool {
        self.host_id == other.host_id
            && self.hostname == other.hostname
            && self.version == other.version
            && self.database == other.database
            && self.rotation == other.rotation
    }
}

/// Lightweight liveness extension for an already announced server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub name: String,
    pub host_id: String,
    pub expires: SystemTime,
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_database() -> Database {
        let mut db = Database::new("pg1", PROTOCOL_POSTGRES, "localhost:5432");
        db.static_labels.insert("env".to_string(), "prod".to_string());
        db
    }

    #[test]
    fn test_all_labels_merges_dynamic_results() {
        let mut db = test_database();
        let mut label = CommandLabel::new(Duration::from_secs(60), vec!["hostname".to_string()]);
        label.result = "db-host-1".to_string();
        db.dynamic_labels.insert("host".to_string(), label);

        let labels = db.all_labels();
        assert_eq!(labels.get("env"), Some(&"prod".to_string()));
        assert_eq!(labels.get("host"), Some(&"db-host-1".to_string()));
    }

    #[test]
    fn test_needs_cloud_ca() {
        let mut db = test_database();
        assert!(!db.needs_cloud_ca());

        db.aws = Some(AwsMetadata {
            region: "us-east-1".to_string(),
            kind: AwsDatabaseKind::Rds,
        });
        assert!(db.needs_cloud_ca());

        db.ca_cert = Some("-----BEGIN CERTIFICATE-----".to_string());
        assert!(!db.needs_cloud_ca());
    }

    #[test]
    fn test_same_content_ignores_expiry() {
        let now = SystemTime::now();
        let a = DatabaseServer {
            host_id: "host".to_string(),
            hostname: "gw".to_string(),
            version: "0.1.0".to_string(),
            database: test_database(),
            rotation: None,
            expiry: now,
        };
        let mut b = a.clone();
        b.expiry = now + Duration::from_secs(600);
        assert!(a.same_content(&b));
        assert_ne!(a, b);

        b.database.static_labels.insert("env".to_string(), "dev".to_string());
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_command_label_serde() {
        let label = CommandLabel::new(Duration::from_secs(30), vec!["uptime".to_string()]);
        let json = serde_json::to_string(&label).unwrap();
        assert!(json.contains("\"period\":30"));
        let parsed: CommandLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, label);
    }
}
