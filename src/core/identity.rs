/// Caller identity extracted from a verified client certificate
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Roles reserved for infrastructure components. A certificate carrying one
/// of them identifies a service, not a user.
pub const SYSTEM_ROLES: &[&str] = &["Admin", "Auth", "Proxy", "Node", "Db", "Kube", "App"];

/// Database the caller asked to be routed to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteToDatabase {
    /// Name of the proxied database service
    pub service_name: String,
    pub protocol: String,
    /// Database-level account to connect as
    pub username: String,
    /// Database (schema) name within the backend
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub roles: Vec<String>,
    /// Cluster the connection is routed to
    pub route_to_cluster: String,
    /// Cluster whose CA issued the certificate
    pub issuing_cluster: String,
    /// Usage restrictions encoded in the certificate; empty means unrestricted
    pub usage: Vec<String>,
    pub route_to_database: RouteToDatabase,
    /// Certificate not-after
    pub expires: SystemTime,
    /// Hex SHA-256 of the leaf certificate
    pub fingerprint: String,
}

impl Identity {
    pub fn new<S: Into<String>>(username: S, roles: Vec<String>, expires: SystemTime) -> Self {
        Self {
            username: username.into(),
            roles,
            route_to_cluster: String::new(),
            issuing_cluster: String::new(),
            usage: Vec::new(),
            route_to_database: RouteToDatabase::default(),
            expires,
            fingerprint: String::new(),
        }
    }

    pub fn with_route(mut self, route: RouteToDatabase) -> Self {
        self.route_to_database = route;
        self
    }

    pub fn system_role(&self) -> Option<&str> {
        self.roles
            .iter()
            .map(String::as_str)
            .find(|role| SYSTEM_ROLES.contains(role))
    }
}

/// Kind of principal behind a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserKind {
    /// User issued by the local cluster's CA
    Local,
    /// User of a trusted remote cluster
    Remote { cluster: String },
    /// Infrastructure component. Never allowed to open database sessions.
    Builtin { role: String },
}

impl fmt::Display for UserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserKind::Local => write!(f, "local user"),
            UserKind::Remote { cluster } => write!(f, "remote user from {}", cluster),
            UserKind::Builtin { role } => write!(f, "builtin role {}", role),
        }
    }
}

/// Typed identity attached to an accepted connection
#[derive(Debug, Clone)]
pub struct IdentityContext {
    pub kind: UserKind,
    pub identity: Identity,
}

impl IdentityContext {
    pub fn local(identity: Identity) -> Self {
        Self {
            kind: UserKind::Local,
            identity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_role_detection() {
        let user = Identity::new("alice", vec!["dev".to_string()], SystemTime::now());
        assert_eq!(user.system_role(), None);

        let proxy = Identity::new("host-1", vec!["Proxy".to_string()], SystemTime::now());
        assert_eq!(proxy.system_role(), Some("Proxy"));
    }

    #[test]
    fn test_user_kind_display() {
        assert_eq!(UserKind::Local.to_string(), "local user");
        assert_eq!(
            UserKind::Remote { cluster: "leaf".to_string() }.to_string(),
            "remote user from leaf"
        );
    }
}
