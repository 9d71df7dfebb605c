//! Cross-process lock service on advisory file locks
//!
//! Every lock is a pair of files under the configured lock directory:
//!
//! - `<path>.lock`: existence marks creation; S holds it shared, X exclusive
//! - `<path>.intent`: held exclusively by S+ and X, so at most one of them
//!   exists at any time and S+ can upgrade without deadlocking another S+
//!
//! Files are always locked intent first, then main. OS locks are dropped
//! with the file handles, which also covers crashed holders.

use crate::error::{BuildEnvError, BuildEnvResult};
use crate::lock::{HeldLock, LockGuard, LockMode, LockPath, LockService};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Lock service backed by `flock`-style locks in a shared directory
#[derive(Debug, Clone)]
pub struct FileLockService {
    root: PathBuf,
}

impl FileLockService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base(&self, path: &LockPath) -> PathBuf {
        path.segments().fold(self.root.clone(), |dir, segment| dir.join(segment))
    }

    fn main_file(&self, path: &LockPath) -> PathBuf {
        with_suffix(self.base(path), "lock")
    }

    fn intent_file(&self, path: &LockPath) -> PathBuf {
        with_suffix(self.base(path), "intent")
    }
}

/// Append `.suffix` without touching dots already in the name
fn with_suffix(path: PathBuf, suffix: &str) -> PathBuf {
    let mut name = path.into_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn open_existing(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn open_or_create(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Whether `file` is still the file linked at `path`
///
/// A lock removed and recreated while we waited leaves us holding the
/// old, unlinked inode.
fn is_linked_at(file: &File, path: &Path) -> std::io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run a blocking lock call off the async workers
async fn blocking<T, F>(what: String, f: F) -> BuildEnvResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> BuildEnvResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BuildEnvError::Internal(format!("{} panicked: {}", what, e)))?
}

/// Files held for one granted lock
struct FileHeld {
    main: File,
    _intent: Option<File>,
    main_path: PathBuf,
}

impl FileHeld {
    fn lock(
        main_path: PathBuf,
        intent_path: PathBuf,
        mode: LockMode,
        display: String,
    ) -> BuildEnvResult<Self> {
        let main = match open_existing(&main_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BuildEnvError::NoSuchLock(display));
            }
            Err(e) => return Err(BuildEnvError::io(format!("opening {}", main_path.display()), e)),
        };

        let intent = if matches!(mode, LockMode::SharedUpgrade | LockMode::Exclusive) {
            let intent = open_or_create(&intent_path)
                .map_err(|e| BuildEnvError::io(format!("opening {}", intent_path.display()), e))?;
            FileExt::lock_exclusive(&intent)
                .map_err(|e| BuildEnvError::io(format!("locking {}", intent_path.display()), e))?;
            Some(intent)
        } else {
            None
        };

        let locked = match mode {
            LockMode::Exclusive => FileExt::lock_exclusive(&main),
            LockMode::Shared | LockMode::SharedUpgrade => FileExt::lock_shared(&main),
        };
        locked.map_err(|e| BuildEnvError::io(format!("locking {}", main_path.display()), e))?;

        let stale = |file: &File, path: &Path| {
            is_linked_at(file, path)
                .map(|linked| !linked)
                .map_err(|e| BuildEnvError::io(format!("checking {}", path.display()), e))
        };
        if stale(&main, &main_path)? {
            return Err(BuildEnvError::NoSuchLock(display));
        }
        if let Some(intent) = &intent {
            if stale(intent, &intent_path)? {
                return Err(BuildEnvError::NoSuchLock(display));
            }
        }

        Ok(Self {
            main,
            _intent: intent,
            main_path,
        })
    }
}

#[async_trait]
impl HeldLock for FileHeld {
    async fn upgrade(&mut self) -> BuildEnvResult<()> {
        let main = self
            .main
            .try_clone()
            .map_err(|e| BuildEnvError::io("duplicating lock handle", e))?;
        let path = self.main_path.clone();
        // flock converts the lock held by the shared open file description
        blocking(format!("upgrading {}", path.display()), move || {
            FileExt::lock_exclusive(&main)
                .map_err(|e| BuildEnvError::io(format!("upgrading {}", path.display()), e))
        })
        .await
    }
}

#[async_trait]
impl LockService for FileLockService {
    async fn create(
        &self,
        path: &LockPath,
        acquire_exclusive: bool,
    ) -> BuildEnvResult<Option<LockGuard>> {
        let main_path = self.main_file(path);
        let intent_path = self.intent_file(path);
        let display = path.to_string();
        debug!("Creating lock {} (exclusive: {})", path, acquire_exclusive);

        let held = blocking(format!("creating lock {}", path), move || {
            if let Some(parent) = main_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| BuildEnvError::io(format!("creating {}", parent.display()), e))?;
            }
            if main_path.exists() {
                return Err(BuildEnvError::LockExists(display));
            }

            if !acquire_exclusive {
                return match OpenOptions::new().write(true).create_new(true).open(&main_path) {
                    Ok(_) => Ok(None),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        Err(BuildEnvError::LockExists(display))
                    }
                    Err(e) => Err(BuildEnvError::io(format!("creating {}", main_path.display()), e)),
                };
            }

            let intent = open_or_create(&intent_path)
                .map_err(|e| BuildEnvError::io(format!("opening {}", intent_path.display()), e))?;
            FileExt::lock_exclusive(&intent)
                .map_err(|e| BuildEnvError::io(format!("locking {}", intent_path.display()), e))?;

            // Lock a private file first, then publish it under the real name
            let staging = with_suffix(main_path.clone(), &format!("{}.tmp", Uuid::new_v4().simple()));
            let main = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&staging)
                .map_err(|e| BuildEnvError::io(format!("creating {}", staging.display()), e))?;
            FileExt::lock_exclusive(&main)
                .map_err(|e| BuildEnvError::io(format!("locking {}", staging.display()), e))?;

            let linked = fs::hard_link(&staging, &main_path);
            let _ = fs::remove_file(&staging);
            match linked {
                Ok(()) => Ok(Some(FileHeld {
                    main,
                    _intent: Some(intent),
                    main_path,
                })),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    Err(BuildEnvError::LockExists(display))
                }
                Err(e) => Err(BuildEnvError::io(format!("creating {}", main_path.display()), e)),
            }
        })
        .await?;

        Ok(held.map(|held| LockGuard::new(path.clone(), LockMode::Exclusive, Box::new(held))))
    }

    async fn acquire(&self, path: &LockPath, mode: LockMode) -> BuildEnvResult<LockGuard> {
        let main_path = self.main_file(path);
        let intent_path = self.intent_file(path);
        let display = path.to_string();
        debug!("Acquiring lock {} in {}", path, mode);

        let held = blocking(format!("acquiring lock {}", path), move || {
            FileHeld::lock(main_path, intent_path, mode, display)
        })
        .await?;

        Ok(LockGuard::new(path.clone(), mode, Box::new(held)))
    }

    async fn exists(&self, path: &LockPath) -> BuildEnvResult<bool> {
        Ok(self.main_file(path).exists())
    }

    async fn remove(&self, path: &LockPath) -> BuildEnvResult<()> {
        debug!("Removing lock {}", path);
        for file in [self.main_file(path), self.intent_file(path)] {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(BuildEnvError::io(format!("removing {}", file.display()), e)),
            }
        }
        Ok(())
    }
}
