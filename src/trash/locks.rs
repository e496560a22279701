//! Per-key async locks so that two operations on the same key never
//! interleave. Keys in different buckets never contend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockKey = (String, String);

#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one operation on one key.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<LockKey, Arc<AsyncMutex<()>>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn lock(&self, bucket: &str, key: &str) -> KeyGuard<'_> {
        let lock_key = (bucket.to_string(), key.to_string());
        let mutex = {
            let mut table = self.table();
            // Entries only the table still references are idle, including
            // ones left behind by waiters that were cancelled.
            table.retain(|k, m| k == &lock_key || Arc::strong_count(m) > 1);
            table.entry(lock_key.clone()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: lock_key,
            guard: Some(guard),
        }
    }

    /// Lock several keys of one bucket in a fixed order.
    pub async fn lock_all(&self, bucket: &str, keys: &[&str]) -> Vec<KeyGuard<'_>> {
        let mut keys = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(bucket, key).await);
        }
        guards
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.locks.table();
        if table
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_waits_other_keys_do_not() {
        let locks = Arc::new(KeyLocks::new());
        let held = locks.lock("b", "k").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("b", "j")).await;
        assert!(other.is_ok());
        drop(other);

        let other_bucket =
            tokio::time::timeout(Duration::from_millis(50), locks.lock("c", "k")).await;
        assert!(other_bucket.is_ok());
        drop(other_bucket);

        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("b", "k")).await;
        assert!(same.is_err());

        drop(held);
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("b", "k")).await;
        assert!(same.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_dropped() {
        let locks = KeyLocks::new();
        {
            let _guards = locks.lock_all("b", &["z", "a", "z"]).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }
}
