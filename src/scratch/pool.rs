//! Scratch space lookup, lazy creation and deletion

use crate::cluster::Cluster;
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::lock::Lock;
use crate::scratch::{scratch_volume, ScratchSpace, VOLUME_PREFIX};
use crate::storage::{destroy_volume, format_volume, Volume};
use tracing::{debug, info, warn};

pub(crate) fn scratch_lock(cluster: &Cluster, volume: &Volume) -> BuildEnvResult<Lock> {
    cluster.define_lock(format!("scratch/{}", volume.name))
}

/// Entry point for scratch space operations
#[derive(Debug, Clone)]
pub struct ScratchSpacePool {
    cluster: Cluster,
}

impl ScratchSpacePool {
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }

    /// Open the scratch space `name`, creating it on first use
    ///
    /// `rw` holds it in X, otherwise in S. Only a writer may create it; a
    /// reader asking for a missing space gets `NoSuchScratchSpace`.
    /// `size_mb` defaults to the configured quota.
    pub async fn get_or_create(
        &self,
        name: &str,
        rw: bool,
        size_mb: Option<u64>,
    ) -> BuildEnvResult<ScratchSpace> {
        let settings = self.cluster.settings();
        let volume = scratch_volume(settings, name);
        let lock = scratch_lock(&self.cluster, &volume)?;
        let storage = self.cluster.storage();

        // Looking at a space that was never created leaves nothing behind
        if !rw && !lock.exists().await? && !storage.exists(&volume).await? {
            return Err(BuildEnvError::NoSuchScratchSpace(name.to_string()));
        }
        lock.ensure().await?;

        let guard = if rw {
            lock.acquire_x().await?
        } else {
            lock.acquire_s().await?
        };

        if !storage.exists(&volume).await? {
            if !rw {
                return Err(BuildEnvError::NoSuchScratchSpace(name.to_string()));
            }

            let size_mb = size_mb.unwrap_or(settings.scratch_size_mb);
            storage.create(&volume, size_mb).await?;
            let formatted =
                format_volume(storage, self.cluster.mounter(), &volume, &settings.fs_type).await;
            if let Err(e) = formatted {
                if let Err(cleanup) = destroy_volume(storage, &volume).await {
                    warn!("Failed to remove unformatted volume {}: {}", volume, cleanup);
                }
                return Err(e);
            }
            info!("Created scratch space {} ({} MB)", name, size_mb);
        }

        debug!("Opened scratch space {} ({})", name, if rw { "rw" } else { "ro" });
        Ok(ScratchSpace::new(
            name.to_string(),
            volume,
            self.cluster.clone(),
            guard,
        ))
    }

    /// Remove a scratch space with all its snapshots
    ///
    /// Returns `false` when neither the volume nor its lock existed.
    pub async fn delete_scratch_space(&self, name: &str) -> BuildEnvResult<bool> {
        let volume = scratch_volume(self.cluster.settings(), name);
        let lock = scratch_lock(&self.cluster, &volume)?;

        if !lock.exists().await? {
            if !self.cluster.storage().exists(&volume).await? {
                return Ok(false);
            }
            // Orphaned volume: recreate the lock so teardown is still serialised
            lock.ensure().await?;
        }

        let guard = match lock.acquire_x().await {
            Ok(guard) => guard,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        let existed = destroy_volume(self.cluster.storage(), &volume).await?;
        lock.remove().await?;
        drop(guard);

        if existed {
            info!("Deleted scratch space {}", name);
        }
        Ok(existed)
    }

    /// Names of all scratch volumes in the pool
    pub async fn list(&self) -> BuildEnvResult<Vec<String>> {
        Ok(self
            .cluster
            .storage()
            .list(&self.cluster.settings().scratch_pool)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(VOLUME_PREFIX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scratch::volume_name;
    use crate::storage::BlockStorage;
    use crate::testing::TestCluster;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn setup() -> (TempDir, TestCluster, ScratchSpacePool) {
        let temp = TempDir::new().unwrap();
        let test = Cluster::for_tests(temp.path());
        let pool = ScratchSpacePool::new(test.cluster.clone());
        (temp, test, pool)
    }

    #[tokio::test]
    async fn reader_cannot_create() {
        let (_temp, test, pool) = setup().await;
        let err = pool.get_or_create("build-1", false, None).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::NoSuchScratchSpace(_)));
        assert!(test.storage.volumes("scratch").is_empty());

        let volume = scratch_volume(test.cluster.settings(), "build-1");
        let lock = scratch_lock(&test.cluster, &volume).unwrap();
        assert!(!lock.exists().await.unwrap());
    }

    #[tokio::test]
    async fn created_once_then_reused() {
        let (_temp, test, pool) = setup().await;
        let space = pool.get_or_create("build-1", true, Some(8)).await.unwrap();
        assert!(space.is_writable());
        drop(space);

        let again = pool.get_or_create("build-1", true, None).await.unwrap();
        assert_eq!(again.volume().name, volume_name("build-1"));
        let formats = test
            .mounter
            .events()
            .iter()
            .filter(|e| e.starts_with("format"))
            .count();
        assert_eq!(formats, 1);
        assert_eq!(pool.list().await.unwrap(), vec![volume_name("build-1")]);
    }

    #[tokio::test]
    async fn writer_excludes_other_handles() {
        let (_temp, _test, pool) = setup().await;
        let writer = pool.get_or_create("build-1", true, None).await.unwrap();

        let blocked = timeout(
            Duration::from_millis(50),
            pool.get_or_create("build-1", false, None),
        )
        .await;
        assert!(blocked.is_err());

        drop(writer);
        pool.get_or_create("build-1", false, None).await.unwrap();
    }

    #[tokio::test]
    async fn delete_nonexistent_returns_false() {
        let (_temp, _test, pool) = setup().await;
        assert!(!pool.delete_scratch_space("never-created").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_snapshots_volume_and_lock() {
        let (_temp, test, pool) = setup().await;
        let mut space = pool.get_or_create("build-1", true, None).await.unwrap();
        space.create_snapshot("a").await.unwrap();
        space.create_snapshot("b").await.unwrap();
        drop(space);

        assert!(pool.delete_scratch_space("build-1").await.unwrap());
        assert!(test.storage.volumes("scratch").is_empty());
        assert!(!pool.delete_scratch_space("build-1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_recovers_orphaned_volume() {
        let (_temp, test, pool) = setup().await;
        let volume = scratch_volume(test.cluster.settings(), "lost");
        test.storage.create(&volume, 1).await.unwrap();

        assert!(pool.delete_scratch_space("lost").await.unwrap());
        assert!(test.storage.volumes("scratch").is_empty());
    }

    #[tokio::test]
    async fn failed_format_removes_volume() {
        let (_temp, test, pool) = setup().await;
        test.storage.fail_on("map");
        assert!(pool.get_or_create("build-1", true, None).await.is_err());
        assert!(test.storage.volumes("scratch").is_empty());
    }
}
