//! Per-build scratch spaces with named snapshots
//!
//! A scratch space is created lazily at a fixed quota, mounted (not
//! namespaced) while its build runs, snapshotted after each finished stage
//! and reverted to the last good snapshot when a stage fails.

mod pool;

pub use pool::ScratchSpacePool;

use crate::cluster::{Cluster, Settings};
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::lock::{LockGuard, LockMode};
use crate::storage::{destroy_volume, validate_snapshot_name, Volume};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prefix of every scratch volume name
pub const VOLUME_PREFIX: &str = "scratch-";

/// Readable, collision-free volume name for a scratch space
///
/// Names come from build ids and may contain anything, so the readable part
/// is sanitised and shortened and a hash of the full name is appended.
pub fn volume_name(name: &str) -> String {
    let readable: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(48)
        .collect();
    let digest = Sha256::digest(name.as_bytes());
    format!("{}{}-{}", VOLUME_PREFIX, readable, &hex::encode(digest)[..12])
}

pub(crate) fn scratch_volume(settings: &Settings, name: &str) -> Volume {
    Volume::new(&settings.scratch_pool, volume_name(name))
}

#[derive(Debug, Clone)]
struct ScratchMount {
    device: PathBuf,
    target: PathBuf,
}

/// An open scratch space, holding its lock for as long as it lives
pub struct ScratchSpace {
    name: String,
    volume: Volume,
    cluster: Cluster,
    guard: LockGuard,
    mounted: Option<ScratchMount>,
    snapshot_mounts: BTreeMap<String, ScratchMount>,
}

impl ScratchSpace {
    pub(crate) fn new(name: String, volume: Volume, cluster: Cluster, guard: LockGuard) -> Self {
        Self {
            name,
            volume,
            cluster,
            guard,
            mounted: None,
            snapshot_mounts: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Held exclusively, so writes and snapshot changes are allowed
    pub fn is_writable(&self) -> bool {
        self.guard.mode() == LockMode::Exclusive
    }

    pub fn mount_path(&self) -> PathBuf {
        self.cluster
            .settings()
            .scratch_mount_root
            .join(&self.volume.name)
    }

    pub fn snapshot_mount_path(&self, snapshot: &str) -> PathBuf {
        self.cluster
            .settings()
            .scratch_mount_root
            .join(format!("{}@{}", self.volume.name, snapshot))
    }

    /// Where the live volume is mounted by this handle
    pub fn mounted_at(&self) -> Option<&Path> {
        self.mounted.as_ref().map(|m| m.target.as_path())
    }

    fn require_writable(&self) -> BuildEnvResult<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(BuildEnvError::NotWritable(format!("scratch space {}", self.name)))
        }
    }

    async fn require_snapshot(&self, snapshot: &str) -> BuildEnvResult<bool> {
        let found = self
            .cluster
            .storage()
            .snapshot_list(&self.volume)
            .await?
            .into_iter()
            .find(|s| s.name == snapshot)
            .ok_or_else(|| BuildEnvError::NoSuchSnapshot {
                volume: self.volume.name.clone(),
                snapshot: snapshot.to_string(),
            })?;
        Ok(found.protected)
    }

    /// Mount the live volume, read-write if held in X
    pub async fn mount(&mut self) -> BuildEnvResult<PathBuf> {
        let target = self.mount_path();
        if self.mounted.is_some() || self.cluster.mounter().is_mounted(&target).await? {
            return Err(BuildEnvError::ScratchSpaceAlreadyMounted(self.name.clone()));
        }

        let read_only = !self.is_writable();
        let storage = self.cluster.storage();
        let device = storage.map(&self.volume, None, read_only).await?;
        if let Err(e) = self.cluster.mounter().mount(&device, &target, read_only).await {
            if let Err(unmap) = storage.unmap(&device).await {
                warn!("Failed to unmap {} after mount failure: {}", device.display(), unmap);
            }
            return Err(e);
        }

        info!("Mounted scratch space {} at {}", self.name, target.display());
        self.mounted = Some(ScratchMount {
            device,
            target: target.clone(),
        });
        Ok(target)
    }

    pub async fn unmount(&mut self) -> BuildEnvResult<()> {
        let mount = self
            .mounted
            .clone()
            .ok_or_else(|| BuildEnvError::ScratchSpaceNotMounted(self.name.clone()))?;

        self.cluster.mounter().umount(&mount.target).await?;
        self.mounted = None;
        self.cluster.storage().unmap(&mount.device).await?;
        tokio::fs::remove_dir(&mount.target).await.ok();
        info!("Unmounted scratch space {}", self.name);
        Ok(())
    }

    /// Take a named snapshot, quiescing the filesystem if it is mounted
    pub async fn create_snapshot(&mut self, snapshot: &str) -> BuildEnvResult<()> {
        self.require_writable()?;
        validate_snapshot_name(snapshot)?;

        let storage = self.cluster.storage();
        if storage
            .snapshot_list(&self.volume)
            .await?
            .iter()
            .any(|s| s.name == snapshot)
        {
            return Err(BuildEnvError::SnapshotExists {
                volume: self.volume.name.clone(),
                snapshot: snapshot.to_string(),
            });
        }

        let Some(mount) = &self.mounted else {
            storage.snapshot_create(&self.volume, snapshot).await?;
            info!("Snapshot {}@{} created", self.name, snapshot);
            return Ok(());
        };

        let mounter = self.cluster.mounter();
        mounter.freeze(&mount.target).await?;
        let created = storage.snapshot_create(&self.volume, snapshot).await;
        let thawed = mounter.thaw(&mount.target).await;
        created?;
        thawed?;
        info!("Snapshot {}@{} created", self.name, snapshot);
        Ok(())
    }

    /// Roll the volume back to `snapshot`, remounting if it was mounted
    pub async fn revert_snapshot(&mut self, snapshot: &str) -> BuildEnvResult<()> {
        self.require_writable()?;
        self.require_snapshot(snapshot).await?;

        let was_mounted = self.mounted.is_some();
        if was_mounted {
            self.unmount().await?;
        }
        self.cluster
            .storage()
            .snapshot_rollback(&self.volume, snapshot)
            .await?;
        if was_mounted {
            self.mount().await?;
        }
        info!("Scratch space {} reverted to {}", self.name, snapshot);
        Ok(())
    }

    pub async fn delete_snapshot(&mut self, snapshot: &str) -> BuildEnvResult<()> {
        self.require_writable()?;
        let protected = self.require_snapshot(snapshot).await?;

        if self.snapshot_mounts.contains_key(snapshot) {
            self.unmount_snapshot(snapshot).await?;
        }
        let storage = self.cluster.storage();
        if protected {
            storage.snapshot_unprotect(&self.volume, snapshot).await?;
        }
        storage.snapshot_remove(&self.volume, snapshot).await?;
        debug!("Snapshot {}@{} deleted", self.name, snapshot);
        Ok(())
    }

    /// Snapshot names, oldest first
    pub async fn list_snapshots(&self) -> BuildEnvResult<Vec<String>> {
        Ok(self
            .cluster
            .storage()
            .snapshot_list(&self.volume)
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    /// Mount a snapshot read-only at `<mount_root>/<volume>@<snapshot>`
    pub async fn mount_snapshot(&mut self, snapshot: &str) -> BuildEnvResult<PathBuf> {
        self.require_snapshot(snapshot).await?;
        let target = self.snapshot_mount_path(snapshot);
        if self.snapshot_mounts.contains_key(snapshot)
            || self.cluster.mounter().is_mounted(&target).await?
        {
            return Err(BuildEnvError::ScratchSpaceAlreadyMounted(format!(
                "{}@{}",
                self.name, snapshot
            )));
        }

        let storage = self.cluster.storage();
        let device = storage.map(&self.volume, Some(snapshot), true).await?;
        if let Err(e) = self.cluster.mounter().mount(&device, &target, true).await {
            if let Err(unmap) = storage.unmap(&device).await {
                warn!("Failed to unmap {} after mount failure: {}", device.display(), unmap);
            }
            return Err(e);
        }

        self.snapshot_mounts.insert(
            snapshot.to_string(),
            ScratchMount {
                device,
                target: target.clone(),
            },
        );
        Ok(target)
    }

    pub async fn unmount_snapshot(&mut self, snapshot: &str) -> BuildEnvResult<()> {
        let mount = self
            .snapshot_mounts
            .get(snapshot)
            .cloned()
            .ok_or_else(|| {
                BuildEnvError::ScratchSpaceNotMounted(format!("{}@{}", self.name, snapshot))
            })?;

        self.cluster.mounter().umount(&mount.target).await?;
        self.snapshot_mounts.remove(snapshot);
        self.cluster.storage().unmap(&mount.device).await?;
        tokio::fs::remove_dir(&mount.target).await.ok();
        Ok(())
    }

    async fn unmount_all(&mut self) -> BuildEnvResult<()> {
        let snapshots: Vec<String> = self.snapshot_mounts.keys().cloned().collect();
        for snapshot in snapshots {
            self.unmount_snapshot(&snapshot).await?;
        }
        if self.mounted.is_some() {
            self.unmount().await?;
        }
        Ok(())
    }

    /// Remove the scratch space with all snapshots and its lock
    pub async fn destroy(mut self) -> BuildEnvResult<()> {
        self.require_writable()?;
        self.unmount_all().await?;
        destroy_volume(self.cluster.storage(), &self.volume).await?;
        pool::scratch_lock(&self.cluster, &self.volume)?.remove().await?;
        info!("Destroyed scratch space {}", self.name);
        Ok(())
    }

    /// Unmount everything and release the lock
    pub async fn close(mut self) -> BuildEnvResult<()> {
        self.unmount_all().await
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        if self.mounted.is_some() || !self.snapshot_mounts.is_empty() {
            warn!("Scratch space {} released while still mounted", self.name);
        }
    }
}

impl fmt::Debug for ScratchSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchSpace")
            .field("name", &self.name)
            .field("volume", &self.volume)
            .field("mode", &self.guard.mode())
            .field("mounted", &self.mounted_at())
            .finish()
    }
}
