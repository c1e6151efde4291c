/// Per-connection session built after successful authorization
use crate::auth::AccessChecker;
use crate::core::{Database, Identity};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Session information for one proxied connection.
///
/// Owned by the task handling the connection; the statement cache and the
/// startup parameters are never shared with other connections.
pub struct Session {
    /// Unique session id (UUID v4)
    pub id: String,
    pub cluster_name: String,
    /// Host id of the gateway serving the session
    pub host_id: String,
    pub database: Database,
    pub identity: Identity,
    /// Database account requested by the caller
    pub database_user: String,
    /// Database (schema) requested by the caller
    pub database_name: String,
    /// Authorization decision object consulted by engines
    pub checker: Arc<dyn AccessChecker>,
    /// Protocol handshake parameters collected by the engine
    pub startup_parameters: HashMap<String, String>,
    pub statements: StatementsCache,
    pub started_at: SystemTime,
    /// Session-scoped logging span carrying `id` and `db`
    pub span: tracing::Span,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cluster_name", &self.cluster_name)
            .field("database", &self.database.name)
            .field("user", &self.identity.username)
            .field("database_user", &self.database_user)
            .field("database_name", &self.database_name)
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "db[{}] user[{}] database_user[{}] database_name[{}]",
            self.database.name, self.identity.username, self.database_user, self.database_name
        )
    }
}

/// A statement prepared by the client during the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub name: String,
    pub query: String,
}

/// Prepared statement cache, keyed by statement name
#[derive(Debug, Default)]
pub struct StatementsCache {
    statements: HashMap<String, Statement>,
}

impl StatementsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a statement, replacing any previous statement with the same name
    pub fn save<S: Into<String>>(&mut self, name: S, query: S) {
        let name = name.into();
        self.statements.insert(
            name.clone(),
            Statement {
                name,
                query: query.into(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Statement> {
        self.statements.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Statement> {
        self.statements.remove(name)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::RouteToDatabase;
    use std::time::Duration;

    /// Session for `alice` connecting as database user `alice` to `app`
    pub(crate) fn session(database: Database, checker: Arc<dyn AccessChecker>) -> Session {
        let identity = Identity::new(
            "alice",
            vec!["dev".to_string()],
            SystemTime::now() + Duration::from_secs(3600),
        )
        .with_route(RouteToDatabase {
            service_name: database.name.clone(),
            protocol: database.protocol.clone(),
            username: "alice".to_string(),
            database: "app".to_string(),
        });
        Session {
            id: "session-1".to_string(),
            cluster_name: "test-cluster".to_string(),
            host_id: "host-1".to_string(),
            database,
            identity,
            database_user: "alice".to_string(),
            database_name: "app".to_string(),
            checker,
            startup_parameters: HashMap::new(),
            statements: StatementsCache::new(),
            started_at: SystemTime::now(),
            span: tracing::Span::none(),
        }
    }
}
