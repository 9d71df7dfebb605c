//! Block storage and mount contracts
//!
//! Provides traits for the external storage operations this crate relies on,
//! so images and scratch spaces can be exercised against fakes:
//! - [`BlockStorage`]: named volumes with snapshots and COW clones (`rbd`)
//! - [`Mounter`]: filesystem creation, mounting and freeze/thaw
//!
//! Every call is awaited to completion and reports failure as-is. Nothing
//! here retries.

mod mount;
mod rbd;

pub use mount::SystemMounter;
pub use rbd::RbdStorage;

use crate::error::BuildEnvResult;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// A volume inside a storage pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Volume {
    pub pool: String,
    pub name: String,
}

impl Volume {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }

    /// `pool/name` or `pool/name@snapshot`
    pub fn spec(&self, snapshot: Option<&str>) -> String {
        match snapshot {
            Some(snapshot) => format!("{}/{}@{}", self.pool, self.name, snapshot),
            None => format!("{}/{}", self.pool, self.name),
        }
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec(None))
    }
}

/// A snapshot as reported by the storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub protected: bool,
}

/// Block storage operations on named volumes
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Allocate a volume of `size_mb` megabytes
    async fn create(&self, volume: &Volume, size_mb: u64) -> BuildEnvResult<()>;

    async fn exists(&self, volume: &Volume) -> BuildEnvResult<bool>;

    /// Volume names in a pool
    async fn list(&self, pool: &str) -> BuildEnvResult<Vec<String>>;

    /// Create `child` as a COW clone of `parent@snapshot` (must be protected)
    async fn clone_snapshot(
        &self,
        parent: &Volume,
        snapshot: &str,
        child: &Volume,
    ) -> BuildEnvResult<()>;

    /// Map a volume (or one of its snapshots) to a local block device
    async fn map(
        &self,
        volume: &Volume,
        snapshot: Option<&str>,
        read_only: bool,
    ) -> BuildEnvResult<PathBuf>;

    async fn unmap(&self, device: &Path) -> BuildEnvResult<()>;

    async fn snapshot_create(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()>;

    /// Snapshots in creation order
    async fn snapshot_list(&self, volume: &Volume) -> BuildEnvResult<Vec<SnapshotInfo>>;

    async fn snapshot_remove(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()>;

    async fn snapshot_protect(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()>;

    async fn snapshot_unprotect(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()>;

    /// Roll the volume's contents back to `snapshot`
    async fn snapshot_rollback(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()>;

    /// Delete a volume; it must have no snapshots left
    async fn remove(&self, volume: &Volume) -> BuildEnvResult<()>;

    /// Human-readable backend name
    fn backend_name(&self) -> &'static str;
}

/// Filesystem operations on mapped devices
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Create an empty filesystem
    async fn format(&self, device: &Path, fs_type: &str) -> BuildEnvResult<()>;

    /// Mount `device` at `target`, creating the directory if needed
    async fn mount(&self, device: &Path, target: &Path, read_only: bool) -> BuildEnvResult<()>;

    async fn umount(&self, target: &Path) -> BuildEnvResult<()>;

    async fn is_mounted(&self, target: &Path) -> BuildEnvResult<bool>;

    /// Suspend writes for a crash-consistent snapshot
    async fn freeze(&self, target: &Path) -> BuildEnvResult<()>;

    async fn thaw(&self, target: &Path) -> BuildEnvResult<()>;
}

/// Map, format and unmap a freshly created volume
pub(crate) async fn format_volume(
    storage: &dyn BlockStorage,
    mounter: &dyn Mounter,
    volume: &Volume,
    fs_type: &str,
) -> BuildEnvResult<()> {
    let device = storage.map(volume, None, false).await?;
    let formatted = mounter.format(&device, fs_type).await;
    let unmapped = storage.unmap(&device).await;
    formatted?;
    unmapped
}

/// Remove every snapshot of a volume and then the volume itself
///
/// Returns `false` when the volume did not exist.
pub(crate) async fn destroy_volume(
    storage: &dyn BlockStorage,
    volume: &Volume,
) -> BuildEnvResult<bool> {
    if !storage.exists(volume).await? {
        return Ok(false);
    }

    for snapshot in storage.snapshot_list(volume).await? {
        if snapshot.protected {
            storage.snapshot_unprotect(volume, &snapshot.name).await?;
        }
        storage.snapshot_remove(volume, &snapshot.name).await?;
    }
    storage.remove(volume).await?;
    Ok(true)
}

/// Snapshot names end up in device specs and mount paths
pub(crate) fn validate_snapshot_name(name: &str) -> BuildEnvResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(crate::error::BuildEnvError::Internal(format!(
            "invalid snapshot name {:?}",
            name
        )))
    }
}
