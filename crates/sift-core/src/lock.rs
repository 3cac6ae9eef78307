use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::StageError;
use crate::stage::Stage;

/// Key-value lock store with TTL semantics.
///
/// `acquire` is an atomic check-and-set: it returns `false` without
/// blocking when the key is already held and unexpired. Expiry is the only
/// recovery mechanism for a crashed holder — there are no heartbeats and no
/// owner identity. `release` is idempotent; releasing a non-held or expired
/// key is a no-op.
pub trait LockStore: Send + Sync + Clone {
    fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StageError>> + Send;

    fn release(&self, key: &str) -> impl Future<Output = Result<(), StageError>> + Send;
}

/// Per-(page, stage) mutual exclusion on top of a [`LockStore`].
///
/// Stages use disjoint key namespaces, so the same page may be locked for
/// two different stages by two workers with no conflict.
#[derive(Clone)]
pub struct StageLockManager<L: LockStore> {
    store: L,
    ttl: Duration,
}

impl<L: LockStore> StageLockManager<L> {
    pub fn new(store: L, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(page_id: i64, stage: Stage) -> String {
        format!("{page_id}:{stage}")
    }

    /// Try to take the stage lock for a page. `false` means another worker
    /// holds it; callers skip the candidate, this is never an error.
    pub async fn acquire(&self, page_id: i64, stage: Stage) -> Result<bool, StageError> {
        self.store.acquire(&Self::key(page_id, stage), self.ttl).await
    }

    pub async fn release(&self, page_id: i64, stage: Stage) -> Result<(), StageError> {
        self.store.release(&Self::key(page_id, stage)).await
    }
}

/// In-memory lock store: a mutex-guarded map of expiry instants.
///
/// Suitable for tests and single-process runs; multi-process deployments
/// use the database-backed store.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    held: Arc<Mutex<HashMap<String, Instant>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, StageError> {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();
        match held.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                held.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), StageError> {
        self.held.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let locks = StageLockManager::new(MemoryLockStore::new(), TTL);
        assert!(locks.acquire(1, Stage::Recap).await.unwrap());
        assert!(!locks.acquire(1, Stage::Recap).await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let locks = StageLockManager::new(MemoryLockStore::new(), TTL);
        assert!(locks.acquire(1, Stage::Recap).await.unwrap());
        locks.release(1, Stage::Recap).await.unwrap();
        assert!(locks.acquire(1, Stage::Recap).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let locks = StageLockManager::new(MemoryLockStore::new(), TTL);
        locks.release(7, Stage::Embed).await.unwrap();
        locks.release(7, Stage::Embed).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable() {
        let locks = StageLockManager::new(MemoryLockStore::new(), Duration::from_millis(10));
        assert!(locks.acquire(1, Stage::Recap).await.unwrap());
        std::thread::sleep(Duration::from_millis(20));
        // TTL elapsed with no release: stale-lock recovery
        assert!(locks.acquire(1, Stage::Recap).await.unwrap());
    }

    #[tokio::test]
    async fn stages_have_disjoint_namespaces() {
        let locks = StageLockManager::new(MemoryLockStore::new(), TTL);
        assert!(locks.acquire(1, Stage::Recap).await.unwrap());
        assert!(locks.acquire(1, Stage::Embed).await.unwrap());
        assert!(locks.acquire(2, Stage::Recap).await.unwrap());
        assert!(!locks.acquire(1, Stage::Recap).await.unwrap());
    }
}
