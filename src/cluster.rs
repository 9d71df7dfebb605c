//! Client handle on the shared build farm
//!
//! A [`Cluster`] bundles the lock service, block storage, mounter and
//! catalog together with the settings every pool needs. It is created once
//! by the caller and passed to [`ImagePool`](crate::image::ImagePool) and
//! [`ScratchSpacePool`](crate::scratch::ScratchSpacePool). Cloning is cheap.

use crate::catalog::{Catalog, JsonCatalog};
use crate::config::Config;
use crate::error::BuildEnvResult;
use crate::lock::{FileLockService, Lock, LockPath, LockService};
use crate::storage::{BlockStorage, Mounter, RbdStorage, SystemMounter};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings shared by the image and scratch pools
#[derive(Debug, Clone)]
pub struct Settings {
    pub image_pool: String,
    pub scratch_pool: String,
    pub fs_type: String,
    pub image_mount_root: PathBuf,
    pub image_size_mb: u64,
    pub scratch_mount_root: PathBuf,
    pub scratch_size_mb: u64,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            image_pool: config.storage.image_pool.clone(),
            scratch_pool: config.storage.scratch_pool.clone(),
            fs_type: config.storage.fs_type.clone(),
            image_mount_root: config.images.mount_root.clone(),
            image_size_mb: config.images.size_mb,
            scratch_mount_root: config.scratch.mount_root.clone(),
            scratch_size_mb: config.scratch.size_mb,
        }
    }
}

/// Connection to locks, storage and catalog
#[derive(Clone)]
pub struct Cluster {
    locks: Arc<dyn LockService>,
    storage: Arc<dyn BlockStorage>,
    mounter: Arc<dyn Mounter>,
    catalog: Arc<dyn Catalog>,
    settings: Arc<Settings>,
}

impl Cluster {
    pub fn new(
        locks: Arc<dyn LockService>,
        storage: Arc<dyn BlockStorage>,
        mounter: Arc<dyn Mounter>,
        catalog: Arc<dyn Catalog>,
        settings: Settings,
    ) -> Self {
        Self {
            locks,
            storage,
            mounter,
            catalog,
            settings: Arc::new(settings),
        }
    }

    /// Production wiring: file locks, rbd, system mounts, JSON catalog
    pub fn from_config(config: &Config) -> Self {
        let mut storage = RbdStorage::new(&config.storage.rbd_binary);
        if let Some(id) = &config.storage.client_id {
            storage = storage.with_client_id(id);
        }
        if let Some(conf) = &config.storage.conf_path {
            storage = storage.with_conf(conf);
        }

        Self::new(
            Arc::new(FileLockService::new(&config.locks.dir)),
            Arc::new(storage),
            Arc::new(SystemMounter::new()),
            Arc::new(JsonCatalog::new(&config.catalog.dir)),
            Settings::from(config),
        )
    }

    /// Client handle on the named lock
    pub fn define_lock(&self, path: impl AsRef<str>) -> BuildEnvResult<Lock> {
        Ok(Lock::new(Arc::clone(&self.locks), LockPath::new(path)?))
    }

    pub fn storage(&self) -> &dyn BlockStorage {
        self.storage.as_ref()
    }

    pub fn mounter(&self) -> &dyn Mounter {
        self.mounter.as_ref()
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("storage", &self.storage.backend_name())
            .field("settings", &self.settings)
            .finish()
    }
}
