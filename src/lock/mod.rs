//! Named, hierarchical locks with three strengths
//!
//! | Mode | Compatible with | Notes |
//! |------|-----------------|-------|
//! | S | S, S+ | many concurrent readers |
//! | S+ | S | reader that may later upgrade; at most one holder |
//! | X | nothing | exclusive |
//!
//! Locks are created once (creating twice is [`BuildEnvError::LockExists`])
//! and acquired any number of times afterwards (acquiring before creation
//! is [`BuildEnvError::NoSuchLock`]). Every acquisition is a [`LockGuard`]
//! that releases exactly the granted mode when dropped.
//!
//! Acquisition order across the crate: a pool or list lock before any
//! individual resource lock. Guards are dropped in reverse order. The one
//! exception is publishing, which already holds the image in X and may then
//! take the available list in X; nothing waits on an image lock while
//! holding the list in X, so this cannot deadlock.

mod file;
mod memory;

pub use file::FileLockService;
pub use memory::MemoryLockService;

use crate::error::{BuildEnvError, BuildEnvResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Lock strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// S
    Shared,
    /// S+
    SharedUpgrade,
    /// X
    Exclusive,
}

impl LockMode {
    /// Whether holding `self` gives at least the guarantees of `required`
    pub fn covers(&self, required: LockMode) -> bool {
        match required {
            Self::Shared => true,
            Self::SharedUpgrade => matches!(self, Self::SharedUpgrade | Self::Exclusive),
            Self::Exclusive => matches!(self, Self::Exclusive),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Shared => "S",
            Self::SharedUpgrade => "S+",
            Self::Exclusive => "X",
        };
        write!(f, "{}", s)
    }
}

/// Slash-separated lock name, e.g. `images/available`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockPath(String);

impl LockPath {
    pub fn new(path: impl AsRef<str>) -> BuildEnvResult<Self> {
        let path = path.as_ref().trim_matches('/');
        let valid = !path.is_empty()
            && path.split('/').all(|segment| {
                !segment.is_empty()
                    && segment != "."
                    && segment != ".."
                    && !segment.contains(char::is_whitespace)
            });
        if !valid {
            return Err(BuildEnvError::Internal(format!("invalid lock path {:?}", path)));
        }
        Ok(Self(path.to_string()))
    }

    /// Append a child segment
    pub fn join(&self, segment: impl fmt::Display) -> BuildEnvResult<Self> {
        Self::new(format!("{}/{}", self.0, segment))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for LockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client contract of the lock service
#[async_trait]
pub trait LockService: Send + Sync {
    /// Create a lock; with `acquire_exclusive` the caller gets it in X
    /// before anyone else can acquire it
    async fn create(&self, path: &LockPath, acquire_exclusive: bool)
        -> BuildEnvResult<Option<LockGuard>>;

    /// Block until `mode` can be granted
    async fn acquire(&self, path: &LockPath, mode: LockMode) -> BuildEnvResult<LockGuard>;

    async fn exists(&self, path: &LockPath) -> BuildEnvResult<bool>;

    /// Forget the lock; missing locks are ignored
    async fn remove(&self, path: &LockPath) -> BuildEnvResult<()>;
}

/// Backend state behind a granted lock; dropping it releases the lock
#[async_trait]
pub trait HeldLock: Send + Sync {
    /// Convert S+ into X, waiting for readers to leave
    async fn upgrade(&mut self) -> BuildEnvResult<()>;
}

/// A granted lock, released on drop
pub struct LockGuard {
    path: LockPath,
    mode: LockMode,
    held: Box<dyn HeldLock>,
}

impl LockGuard {
    pub fn new(path: LockPath, mode: LockMode, held: Box<dyn HeldLock>) -> Self {
        Self { path, mode, held }
    }

    pub fn path(&self) -> &LockPath {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Fail unless the guard gives at least `required`
    pub fn require(&self, required: LockMode) -> BuildEnvResult<()> {
        if self.mode.covers(required) {
            Ok(())
        } else {
            Err(BuildEnvError::LockNotHeld {
                path: self.path.to_string(),
                required: required.to_string(),
            })
        }
    }

    /// Upgrade an S+ guard to X
    pub async fn upgrade(&mut self) -> BuildEnvResult<()> {
        match self.mode {
            LockMode::Exclusive => Ok(()),
            LockMode::SharedUpgrade => {
                self.held.upgrade().await?;
                self.mode = LockMode::Exclusive;
                Ok(())
            }
            LockMode::Shared => Err(BuildEnvError::LockNotHeld {
                path: self.path.to_string(),
                required: LockMode::SharedUpgrade.to_string(),
            }),
        }
    }

    /// Release now instead of at end of scope
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Handle on one named lock, as returned by `Cluster::define_lock`
#[derive(Clone)]
pub struct Lock {
    service: Arc<dyn LockService>,
    path: LockPath,
}

impl Lock {
    pub fn new(service: Arc<dyn LockService>, path: LockPath) -> Self {
        Self { service, path }
    }

    pub fn path(&self) -> &LockPath {
        &self.path
    }

    /// Create the lock, failing with `LockExists` if it already exists
    pub async fn create(&self, acquire_exclusive: bool) -> BuildEnvResult<Option<LockGuard>> {
        self.service.create(&self.path, acquire_exclusive).await
    }

    /// Create the lock unless it already exists
    pub async fn ensure(&self) -> BuildEnvResult<()> {
        match self.service.create(&self.path, false).await {
            Ok(_) | Err(BuildEnvError::LockExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self) -> BuildEnvResult<bool> {
        self.service.exists(&self.path).await
    }

    pub async fn acquire(&self, mode: LockMode) -> BuildEnvResult<LockGuard> {
        self.service.acquire(&self.path, mode).await
    }

    pub async fn acquire_s(&self) -> BuildEnvResult<LockGuard> {
        self.acquire(LockMode::Shared).await
    }

    pub async fn acquire_splus(&self) -> BuildEnvResult<LockGuard> {
        self.acquire(LockMode::SharedUpgrade).await
    }

    pub async fn acquire_x(&self) -> BuildEnvResult<LockGuard> {
        self.acquire(LockMode::Exclusive).await
    }

    pub async fn remove(&self) -> BuildEnvResult<()> {
        self.service.remove(&self.path).await
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("path", &self.path).finish()
    }
}
