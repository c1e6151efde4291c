/// Session locks: deny-list entries that block new sessions and terminate
/// established ones for a matching user or role
use crate::core::Identity;
use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;

/// What a lock applies to. Empty fields match everything else; a lock with
/// no target at all matches nobody.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTarget {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub name: String,
    pub target: LockTarget,
    #[serde(default)]
    pub message: String,
    /// Locks without an expiry stay in force until deleted
    #[serde(default)]
    pub expires: Option<SystemTime>,
}

impl Lock {
    pub fn for_user<S: Into<String>>(name: S, user: S, message: S) -> Self {
        Self {
            name: name.into(),
            target: LockTarget {
                user: Some(user.into()),
                role: None,
            },
            message: message.into(),
            expires: None,
        }
    }

    pub fn for_role<S: Into<String>>(name: S, role: S, message: S) -> Self {
        Self {
            name: name.into(),
            target: LockTarget {
                user: None,
                role: Some(role.into()),
            },
            message: message.into(),
            expires: None,
        }
    }

    pub fn is_in_force(&self, now: SystemTime) -> bool {
        self.expires.map_or(true, |expires| now < expires)
    }

    pub fn matches(&self, identity: &Identity) -> bool {
        if self.target.user.is_none() && self.target.role.is_none() {
            return false;
        }
        let user_matches = self
            .target
            .user
            .as_ref()
            .map_or(true, |user| *user == identity.username);
        let role_matches = self
            .target
            .role
            .as_ref()
            .map_or(true, |role| identity.roles.contains(role));
        user_matches && role_matches
    }

    pub fn denial_message(&self) -> String {
        if self.message.is_empty() {
            format!("lock {:?} is in force", self.name)
        } else {
            format!("lock {:?} is in force: {}", self.name, self.message)
        }
    }
}

/// Source of lock state
pub trait LockWatcher: Send + Sync {
    /// Subscribe to lock changes relevant to `identity`
    fn subscribe(&self, identity: &Identity) -> LockSubscription;
}

/// Live view of the lock set for one identity
#[derive(Debug)]
pub struct LockSubscription {
    identity: Identity,
    rx: watch::Receiver<Arc<Vec<Lock>>>,
}

impl LockSubscription {
    pub fn new(identity: Identity, rx: watch::Receiver<Arc<Vec<Lock>>>) -> Self {
        Self { identity, rx }
    }

    /// First lock in force that matches the subscribed identity
    pub fn check(&self, now: SystemTime) -> Option<Lock> {
        self.rx
            .borrow()
            .iter()
            .find(|lock| lock.is_in_force(now) && lock.matches(&self.identity))
            .cloned()
    }

    /// Wait for the lock set to change. Returns `false` once the watcher
    /// has gone away and no further changes will arrive.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// In-process lock store
#[derive(Debug)]
pub struct LocalLockWatcher {
    tx: watch::Sender<Arc<Vec<Lock>>>,
}

impl LocalLockWatcher {
    pub fn new(locks: Vec<Lock>) -> Self {
        let (tx, _) = watch::channel(Arc::new(locks));
        Self { tx }
    }

    /// Insert a lock, replacing any lock with the same name
    pub fn upsert_lock(&self, lock: Lock) {
        self.tx.send_modify(|locks| {
            let mut updated: Vec<Lock> = locks
                .iter()
                .filter(|existing| existing.name != lock.name)
                .cloned()
                .collect();
            updated.push(lock);
            *locks = Arc::new(updated);
        });
    }

    pub fn delete_lock(&self, name: &str) -> GatewayResult<()> {
        let mut removed = false;
        self.tx.send_if_modified(|locks| {
            if !locks.iter().any(|lock| lock.name == name) {
                return false;
            }
            *locks = Arc::new(locks.iter().filter(|lock| lock.name != name).cloned().collect());
            removed = true;
            true
        });
        if removed {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!("lock {:?} is not found", name)))
        }
    }

    pub fn locks(&self) -> Vec<Lock> {
        self.tx.borrow().as_ref().clone()
    }
}

impl LockWatcher for LocalLockWatcher {
    fn subscribe(&self, identity: &Identity) -> LockSubscription {
        LockSubscription::new(identity.clone(), self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn alice() -> Identity {
        Identity::new(
            "alice",
            vec!["dev".to_string()],
            SystemTime::now() + Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_lock_matching() {
        let identity = alice();
        assert!(Lock::for_user("l1", "alice", "").matches(&identity));
        assert!(!Lock::for_user("l2", "bob", "").matches(&identity));
        assert!(Lock::for_role("l3", "dev", "").matches(&identity));
        assert!(!Lock::for_role("l4", "admin", "").matches(&identity));

        let empty = Lock {
            name: "empty".to_string(),
            target: LockTarget::default(),
            message: String::new(),
            expires: None,
        };
        assert!(!empty.matches(&identity));
    }

    #[test]
    fn test_expired_lock_not_in_force() {
        let now = SystemTime::now();
        let mut lock = Lock::for_user("l1", "alice", "");
        assert!(lock.is_in_force(now));
        lock.expires = Some(now - Duration::from_secs(1));
        assert!(!lock.is_in_force(now));
    }

    #[tokio::test]
    async fn test_subscription_sees_new_locks() {
        let watcher = LocalLockWatcher::new(Vec::new());
        let mut sub = watcher.subscribe(&alice());
        assert!(sub.check(SystemTime::now()).is_none());

        watcher.upsert_lock(Lock::for_user("l1", "alice", "investigating"));
        assert!(sub.changed().await);
        let lock = sub.check(SystemTime::now()).unwrap();
        assert_eq!(lock.name, "l1");
        assert!(lock.denial_message().contains("investigating"));

        watcher.delete_lock("l1").unwrap();
        assert!(sub.check(SystemTime::now()).is_none());
        assert!(watcher.delete_lock("l1").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_subscription_ends_when_watcher_dropped() {
        let watcher = LocalLockWatcher::new(Vec::new());
        let mut sub = watcher.subscribe(&alice());
        drop(watcher);
        assert!(!sub.changed().await);
    }

    #[test]
    fn test_upsert_replaces_by_name() {
        let watcher = LocalLockWatcher::new(vec![Lock::for_user("l1", "alice", "old")]);
        watcher.upsert_lock(Lock::for_user("l1", "alice", "new"));
        let locks = watcher.locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].message, "new");
    }
}
