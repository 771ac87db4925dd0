/// In-process feature locks
///
/// A lock ties one feature id to an authorization string until it expires.
/// Writers must hold the authorization of every unexpired lock on the rows
/// they touch. Expired locks are treated as absent and purged lazily.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;
use crate::core::StoreError;
use super::Transaction;

/// Lock request: who holds it and for how long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLock {
    pub authorization: String,
    pub duration: Duration,
}

impl FeatureLock {
    pub fn new(authorization: impl Into<String>, duration: Duration) -> Self {
        Self {
            authorization: authorization.into(),
            duration,
        }
    }

    /// Lock with a freshly generated authorization
    #[must_use]
    pub fn generate(duration: Duration) -> Self {
        Self::new(Uuid::new_v4().simple().to_string(), duration)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    authorization: String,
    expires: DateTime<Utc>,
}

impl LockEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    /// (type name, feature id) -> lock
    locks: RwLock<HashMap<(String, String), LockEntry>>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every id or none. Ids already locked under the same
    /// authorization are renewed.
    pub fn lock_all(&self, type_name: &str, ids: &[String], lock: &FeatureLock) -> Result<usize, StoreError> {
        self.lock_all_at(type_name, ids, lock, Utc::now())
    }

    pub(crate) fn lock_all_at(
        &self,
        type_name: &str,
        ids: &[String],
        lock: &FeatureLock,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut locks = self.locks.write().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if let Some(entry) = locks.get(&(type_name.to_string(), id.clone())) {
                if entry.is_live(now) && entry.authorization != lock.authorization {
                    return Err(StoreError::FeatureLock(format!("{id} is locked by another authorization")));
                }
            }
        }
        let expires = now + lock.duration;
        for id in ids {
            locks.insert(
                (type_name.to_string(), id.clone()),
                LockEntry {
                    authorization: lock.authorization.clone(),
                    expires,
                },
            );
        }
        debug!(type_name, count = ids.len(), "locked features");
        Ok(ids.len())
    }

    /// Releases every lock held under `authorization`
    pub fn unlock(&self, authorization: &str) -> usize {
        let mut locks = self.locks.write().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, entry| entry.authorization != authorization);
        before - locks.len()
    }

    /// Extends every live lock held under `authorization` by `duration` from now
    pub fn refresh(&self, authorization: &str, duration: Duration) -> usize {
        self.refresh_at(authorization, duration, Utc::now())
    }

    pub(crate) fn refresh_at(&self, authorization: &str, duration: Duration, now: DateTime<Utc>) -> usize {
        let mut locks = self.locks.write().unwrap_or_else(PoisonError::into_inner);
        let mut refreshed = 0;
        for entry in locks.values_mut() {
            if entry.authorization == authorization && entry.is_live(now) {
                entry.expires = now + duration;
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Ids of `type_name` currently locked
    #[must_use]
    pub fn locked_ids(&self, type_name: &str) -> Vec<String> {
        self.locked_ids_at(type_name, Utc::now())
    }

    pub(crate) fn locked_ids_at(&self, type_name: &str, now: DateTime<Utc>) -> Vec<String> {
        self.purge(now);
        self.locks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((t, _), entry)| t == type_name && entry.is_live(now))
            .map(|((_, id), _)| id.clone())
            .collect()
    }

    /// Fails unless `tx` holds the authorization for a live lock on `id`
    pub fn check(&self, type_name: &str, id: &str, tx: &Transaction) -> Result<(), StoreError> {
        self.check_at(type_name, id, tx, Utc::now())
    }

    pub(crate) fn check_at(&self, type_name: &str, id: &str, tx: &Transaction, now: DateTime<Utc>) -> Result<(), StoreError> {
        let locks = self.locks.read().unwrap_or_else(PoisonError::into_inner);
        match locks.get(&(type_name.to_string(), id.to_string())) {
            Some(entry) if entry.is_live(now) && !tx.has_authorization(&entry.authorization) => Err(
                StoreError::FeatureLock(format!("transaction does not hold the lock on {id}")),
            ),
            _ => Ok(()),
        }
    }

    /// Drops locks on deleted features
    pub fn release(&self, type_name: &str, ids: &[String]) {
        let mut locks = self.locks.write().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            locks.remove(&(type_name.to_string(), id.clone()));
        }
    }

    fn purge(&self, now: DateTime<Utc>) {
        self.locks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, entry| entry.is_live(now));
    }
}
