/// Authorization of database connections
///
/// - `middleware`: turns a verified client certificate chain into a typed identity
/// - `locks`: deny-list entries that must terminate matching sessions
/// - `db_auth`: credentials/TLS material used to reach the backend databases
///
/// This module holds the authorizer itself and the role based checker that
/// engines consult for per-database decisions.
pub mod db_auth;
pub mod locks;
pub mod middleware;

pub use db_auth::{CachedDbAuth, DbAuth};
pub use locks::{LocalLockWatcher, Lock, LockSubscription, LockTarget, LockWatcher};
pub use middleware::{CertIdentityMiddleware, ClusterAuthorities, IdentityMiddleware};

use crate::core::{Database, Identity, IdentityContext, UserKind};
use crate::error::{GatewayError, GatewayResult};
use crate::utils::Clock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Wildcard accepted in role database names, users and labels
pub const WILDCARD: &str = "*";

/// Authorization decision object attached to every session
pub trait AccessChecker: Send + Sync + Debug {
    /// Check whether the caller may connect to `database` as `db_user`,
    /// opening `db_name`
    fn check_access_to_database(
        &self,
        database: &Database,
        db_user: &str,
        db_name: &str,
    ) -> GatewayResult<()>;

    /// Shorten the server-wide idle timeout if any role asks for less.
    /// A zero duration means "no idle timeout".
    fn adjust_client_idle_timeout(&self, timeout: Duration) -> Duration;

    fn role_names(&self) -> Vec<String>;
}

/// Result of a successful authorization
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: Identity,
    pub checker: Arc<dyn AccessChecker>,
}

/// Resolves the caller's authorization context
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, ctx: &IdentityContext) -> GatewayResult<AuthContext>;
}

/// Role granting access to databases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    /// Database (schema) names the role may open
    #[serde(default)]
    pub db_names: Vec<String>,
    /// Database accounts the role may connect as
    #[serde(default)]
    pub db_users: Vec<String>,
    /// Label selector; every entry must match the database labels
    #[serde(default)]
    pub db_labels: BTreeMap<String, String>,
    /// Idle timeout override in seconds
    #[serde(default)]
    pub client_idle_timeout_sec: Option<u64>,
}

impl Role {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            db_names: Vec::new(),
            db_users: Vec::new(),
            db_labels: BTreeMap::new(),
            client_idle_timeout_sec: None,
        }
    }

    /// An empty selector matches nothing
    fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.db_labels.is_empty() {
            return false;
        }
        self.db_labels.iter().all(|(key, value)| {
            if key == WILDCARD {
                return true;
            }
            match labels.get(key) {
                Some(actual) => value == WILDCARD || value == actual,
                None => false,
            }
        })
    }

    fn allows(values: &[String], wanted: &str) -> bool {
        values.iter().any(|v| v == WILDCARD || v == wanted)
    }
}

/// Set of roles resolved for one caller
#[derive(Debug, Clone)]
pub struct RoleSet {
    roles: Vec<Role>,
}

impl RoleSet {
    pub fn new(roles: Vec<Role>) -> Self {
        Self { roles }
    }
}

impl AccessChecker for RoleSet {
    fn check_access_to_database(
        &self,
        database: &Database,
        db_user: &str,
        db_name: &str,
    ) -> GatewayResult<()> {
        let labels = database.all_labels();
        let allowed = self.roles.iter().any(|role| {
            role.matches_labels(&labels)
                && Role::allows(&role.db_users, db_user)
                && Role::allows(&role.db_names, db_name)
        });
        if allowed {
            return Ok(());
        }
        Err(GatewayError::access_denied(format!(
            "access to database {:?} as user {:?} (database name {:?}) denied",
            database.name, db_user, db_name
        )))
    }

    fn adjust_client_idle_timeout(&self, timeout: Duration) -> Duration {
        self.roles
            .iter()
            .filter_map(|r| r.client_idle_timeout_sec)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .fold(timeout, |current, role_timeout| {
                if current.is_zero() || role_timeout < current {
                    role_timeout
                } else {
                    current
                }
            })
    }

    fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }
}

/// Authorizer backed by statically configured roles and trusted clusters
pub struct RoleAuthorizer {
    roles: HashMap<String, Role>,
    /// Remote cluster name -> (remote role -> local role)
    trusted_clusters: HashMap<String, HashMap<String, String>>,
    lock_watcher: Arc<dyn LockWatcher>,
    clock: Arc<dyn Clock>,
}

impl RoleAuthorizer {
    pub fn new(roles: Vec<Role>, lock_watcher: Arc<dyn LockWatcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
            trusted_clusters: HashMap::new(),
            lock_watcher,
            clock,
        }
    }

    /// Trust users of `cluster`, mapping their roles through `role_map`
    pub fn with_trusted_cluster<S: Into<String>>(
        mut self,
        cluster: S,
        role_map: HashMap<String, String>,
    ) -> Self {
        self.trusted_clusters.insert(cluster.into(), role_map);
        self
    }

    fn local_role_names(&self, ctx: &IdentityContext) -> GatewayResult<Vec<String>> {
        match &ctx.kind {
            UserKind::Local => Ok(ctx.identity.roles.clone()),
            UserKind::Remote { cluster } => {
                let role_map = self.trusted_clusters.get(cluster).ok_or_else(|| {
                    GatewayError::access_denied(format!("cluster {:?} is not trusted", cluster))
                })?;
                let mapped: Vec<String> = ctx
                    .identity
                    .roles
                    .iter()
                    .filter_map(|remote| {
                        role_map
                            .get(remote)
                            .or_else(|| role_map.get(WILDCARD))
                            .cloned()
                    })
                    .collect();
                if mapped.is_empty() {
                    return Err(GatewayError::access_denied(format!(
                        "no roles of cluster {:?} map to local roles",
                        cluster
                    )));
                }
                Ok(mapped)
            }
            UserKind::Builtin { role } => Err(GatewayError::access_denied(format!(
                "builtin role {} cannot access databases",
                role
            ))),
        }
    }
}

#[async_trait]
impl Authorizer for RoleAuthorizer {
    async fn authorize(&self, ctx: &IdentityContext) -> GatewayResult<AuthContext> {
        let role_names = self.local_role_names(ctx)?;

        if let Some(lock) = self
            .lock_watcher
            .subscribe(&ctx.identity)
            .check(self.clock.now())
        {
            return Err(GatewayError::access_denied(lock.denial_message()));
        }

        let mut roles = Vec::with_capacity(role_names.len());
        for name in &role_names {
            let role = self.roles.get(name).ok_or_else(|| {
                GatewayError::access_denied(format!("role {:?} is not found", name))
            })?;
            roles.push(role.clone());
        }

        Ok(AuthContext {
            identity: ctx.identity.clone(),
            checker: Arc::new(RoleSet::new(roles)),
        })
    }
}
