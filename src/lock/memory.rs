//! In-process lock service
//!
//! Holders are tasks of a single process. Used by tests and by tools that
//! own the whole storage pool.

use crate::error::{BuildEnvError, BuildEnvResult};
use crate::lock::{HeldLock, LockGuard, LockMode, LockPath, LockService};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Holders {
    /// Distinguishes a recreated lock from the one a guard was granted on
    generation: u64,
    shared: usize,
    upgrade: bool,
    exclusive: bool,
}

impl Holders {
    fn can_grant(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.exclusive,
            LockMode::SharedUpgrade => !self.exclusive && !self.upgrade,
            LockMode::Exclusive => !self.exclusive && !self.upgrade && self.shared == 0,
        }
    }

    fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared += 1,
            LockMode::SharedUpgrade => self.upgrade = true,
            LockMode::Exclusive => self.exclusive = true,
        }
    }

    fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared = self.shared.saturating_sub(1),
            LockMode::SharedUpgrade => self.upgrade = false,
            LockMode::Exclusive => self.exclusive = false,
        }
    }
}

#[derive(Default)]
struct Inner {
    locks: Mutex<HashMap<LockPath, Holders>>,
    released: Notify,
    generations: AtomicU64,
}

impl Inner {
    fn locks(&self) -> MutexGuard<'_, HashMap<LockPath, Holders>> {
        // Holders are plain counters, a poisoned map is still consistent
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until `ready` succeeds under the map lock
    async fn wait_for<T>(
        &self,
        mut ready: impl FnMut(&mut HashMap<LockPath, Holders>) -> BuildEnvResult<Option<T>>,
    ) -> BuildEnvResult<T> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = {
                let mut locks = self.locks();
                ready(&mut locks)?
            };
            if let Some(value) = outcome {
                return Ok(value);
            }
            notified.await;
        }
    }
}

/// Lock service whose state lives in this process
#[derive(Clone, Default)]
pub struct MemoryLockService {
    inner: Arc<Inner>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self, path: &LockPath, mode: LockMode, generation: u64) -> LockGuard {
        LockGuard::new(
            path.clone(),
            mode,
            Box::new(MemoryHeld {
                inner: Arc::clone(&self.inner),
                path: path.clone(),
                mode,
                generation,
            }),
        )
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn create(
        &self,
        path: &LockPath,
        acquire_exclusive: bool,
    ) -> BuildEnvResult<Option<LockGuard>> {
        let mut locks = self.inner.locks();
        if locks.contains_key(path) {
            return Err(BuildEnvError::LockExists(path.to_string()));
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let mut holders = Holders {
            generation,
            ..Holders::default()
        };
        if acquire_exclusive {
            holders.grant(LockMode::Exclusive);
        }
        locks.insert(path.clone(), holders);
        drop(locks);

        Ok(acquire_exclusive.then(|| self.guard(path, LockMode::Exclusive, generation)))
    }

    async fn acquire(&self, path: &LockPath, mode: LockMode) -> BuildEnvResult<LockGuard> {
        let generation = self
            .inner
            .wait_for(|locks| {
                let holders = locks
                    .get_mut(path)
                    .ok_or_else(|| BuildEnvError::NoSuchLock(path.to_string()))?;
                if holders.can_grant(mode) {
                    holders.grant(mode);
                    Ok(Some(holders.generation))
                } else {
                    Ok(None)
                }
            })
            .await?;

        Ok(self.guard(path, mode, generation))
    }

    async fn exists(&self, path: &LockPath) -> BuildEnvResult<bool> {
        Ok(self.inner.locks().contains_key(path))
    }

    async fn remove(&self, path: &LockPath) -> BuildEnvResult<()> {
        self.inner.locks().remove(path);
        self.inner.released.notify_waiters();
        Ok(())
    }
}

struct MemoryHeld {
    inner: Arc<Inner>,
    path: LockPath,
    mode: LockMode,
    generation: u64,
}

impl MemoryHeld {
    /// Holders of the lock this guard was granted on, if it still exists
    fn holders<'a>(&self, locks: &'a mut HashMap<LockPath, Holders>) -> Option<&'a mut Holders> {
        locks
            .get_mut(&self.path)
            .filter(|holders| holders.generation == self.generation)
    }
}

#[async_trait]
impl HeldLock for MemoryHeld {
    async fn upgrade(&mut self) -> BuildEnvResult<()> {
        let inner = Arc::clone(&self.inner);
        inner
            .wait_for(|locks| {
                let holders = self
                    .holders(locks)
                    .ok_or_else(|| BuildEnvError::NoSuchLock(self.path.to_string()))?;
                if holders.shared == 0 {
                    holders.upgrade = false;
                    holders.exclusive = true;
                    Ok(Some(()))
                } else {
                    Ok(None)
                }
            })
            .await?;
        self.mode = LockMode::Exclusive;
        Ok(())
    }
}

impl Drop for MemoryHeld {
    fn drop(&mut self) {
        if let Some(holders) = self.holders(&mut self.inner.locks()) {
            holders.release(self.mode);
        }
        self.inner.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const BLOCKED: Duration = Duration::from_millis(50);

    fn path(s: &str) -> LockPath {
        LockPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn acquire_before_create_fails() {
        let service = MemoryLockService::new();
        let err = service.acquire(&path("a"), LockMode::Shared).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::NoSuchLock(_)));
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let service = MemoryLockService::new();
        service.create(&path("a"), false).await.unwrap();
        let err = service.create(&path("a"), false).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::LockExists(_)));
    }

    #[tokio::test]
    async fn create_exclusive_holds_x() {
        let service = MemoryLockService::new();
        let guard = service.create(&path("a"), true).await.unwrap().unwrap();
        assert_eq!(guard.mode(), LockMode::Exclusive);

        let blocked = timeout(BLOCKED, service.acquire(&path("a"), LockMode::Shared)).await;
        assert!(blocked.is_err());

        drop(guard);
        service.acquire(&path("a"), LockMode::Shared).await.unwrap();
    }

    #[tokio::test]
    async fn many_shared_holders() {
        let service = MemoryLockService::new();
        service.create(&path("a"), false).await.unwrap();

        let mut guards = Vec::new();
        for _ in 0..8 {
            let guard = timeout(BLOCKED, service.acquire(&path("a"), LockMode::Shared))
                .await
                .expect("shared acquisition must not block")
                .unwrap();
            guards.push(guard);
        }
        // S+ coexists with readers
        timeout(BLOCKED, service.acquire(&path("a"), LockMode::SharedUpgrade))
            .await
            .expect("S+ must not wait for S")
            .unwrap();
    }

    #[tokio::test]
    async fn second_splus_waits_for_first() {
        let service = MemoryLockService::new();
        service.create(&path("a"), false).await.unwrap();

        let first = service.acquire(&path("a"), LockMode::SharedUpgrade).await.unwrap();

        let contender = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acquire(&LockPath::new("a").unwrap(), LockMode::SharedUpgrade)
                    .await
            })
        };

        tokio::time::sleep(BLOCKED).await;
        assert!(!contender.is_finished());

        drop(first);
        let second = timeout(Duration::from_secs(5), contender)
            .await
            .expect("second S+ must be granted after release")
            .unwrap()
            .unwrap();
        assert_eq!(second.mode(), LockMode::SharedUpgrade);
    }

    #[tokio::test]
    async fn upgrade_waits_for_readers() {
        let service = MemoryLockService::new();
        service.create(&path("a"), false).await.unwrap();

        let reader = service.acquire(&path("a"), LockMode::Shared).await.unwrap();
        let mut writer = service.acquire(&path("a"), LockMode::SharedUpgrade).await.unwrap();

        assert!(timeout(BLOCKED, writer.upgrade()).await.is_err());

        drop(reader);
        writer.upgrade().await.unwrap();
        assert_eq!(writer.mode(), LockMode::Exclusive);

        assert!(timeout(BLOCKED, service.acquire(&path("a"), LockMode::Shared))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn shared_guard_cannot_upgrade() {
        let service = MemoryLockService::new();
        service.create(&path("a"), false).await.unwrap();
        let mut reader = service.acquire(&path("a"), LockMode::Shared).await.unwrap();
        assert!(matches!(
            reader.upgrade().await,
            Err(BuildEnvError::LockNotHeld { .. })
        ));
        assert!(reader.require(LockMode::Exclusive).is_err());
        assert!(reader.require(LockMode::Shared).is_ok());
    }

    #[tokio::test]
    async fn stale_guard_does_not_release_recreated_lock() {
        let service = MemoryLockService::new();
        let old = service.create(&path("a"), true).await.unwrap().unwrap();
        service.remove(&path("a")).await.unwrap();
        let new = service.create(&path("a"), true).await.unwrap().unwrap();

        drop(old);
        assert!(timeout(BLOCKED, service.acquire(&path("a"), LockMode::Exclusive))
            .await
            .is_err());

        drop(new);
        timeout(BLOCKED, service.acquire(&path("a"), LockMode::Exclusive))
            .await
            .expect("X granted once the new holder left")
            .unwrap();
    }

    #[tokio::test]
    async fn release_frees_exactly_the_granted_mode() {
        let service = MemoryLockService::new();
        service.create(&path("a"), false).await.unwrap();

        let reader = service.acquire(&path("a"), LockMode::Shared).await.unwrap();
        let other = service.acquire(&path("a"), LockMode::Shared).await.unwrap();
        reader.release();

        // One reader remains, so X still waits
        assert!(timeout(BLOCKED, service.acquire(&path("a"), LockMode::Exclusive))
            .await
            .is_err());
        drop(other);
        timeout(BLOCKED, service.acquire(&path("a"), LockMode::Exclusive))
            .await
            .expect("X granted once all readers left")
            .unwrap();
    }
}
