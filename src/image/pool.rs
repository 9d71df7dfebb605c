//! Image pool: creation, cloning, publication and deletion
//!
//! Lock order: the available-list lock first, then an image lock. The list
//! lock is never held while waiting for anything but an image lock, and
//! `Image::publish` (which already holds its image in X) only escalates on
//! the list when the image is not registered yet.

use crate::catalog::ImageRecord;
use crate::cluster::Cluster;
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::image::{
    available_lock, image_lock, image_volume, no_such_image, Image, ImageId, FREEZE_SNAPSHOT,
};
use crate::lock::{Lock, LockMode};
use crate::storage::{destroy_volume, format_volume, Volume};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Entry point for image operations
#[derive(Debug, Clone)]
pub struct ImagePool {
    cluster: Cluster,
}

impl ImagePool {
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Create the available-list lock if this is a fresh pool
    pub async fn init(&self) -> BuildEnvResult<()> {
        available_lock(&self.cluster)?.ensure().await
    }

    /// Allocate and format an empty private image, held in X
    pub async fn create_empty(&self, comment: Option<String>) -> BuildEnvResult<Image> {
        let settings = self.cluster.settings();
        let id = ImageId::new();
        let lock = image_lock(&self.cluster, &id)?;
        let guard = lock
            .create(true)
            .await?
            .ok_or_else(|| BuildEnvError::Internal("exclusive lock creation returned no guard".into()))?;

        let volume = image_volume(settings, &id);
        let record = ImageRecord::new(id.clone(), comment, None);
        let created = async {
            self.cluster
                .storage()
                .create(&volume, settings.image_size_mb)
                .await?;
            format_volume(
                self.cluster.storage(),
                self.cluster.mounter(),
                &volume,
                &settings.fs_type,
            )
            .await?;
            self.cluster.catalog().insert(&record).await
        }
        .await;

        if let Err(e) = created {
            self.roll_back(&id, &volume, &lock).await;
            return Err(e);
        }

        info!("Created image {}", id);
        Ok(Image::new(id, self.cluster.clone(), guard))
    }

    /// Clone a published image into a new private image, held in X
    ///
    /// The clone starts with the parent's package catalog.
    pub async fn cow_clone(&self, parent: &ImageId, comment: Option<String>) -> BuildEnvResult<Image> {
        let list = available_lock(&self.cluster)?;
        let _list_guard = list.acquire_s().await?;
        if !self.cluster.catalog().published().await?.contains(parent) {
            return Err(BuildEnvError::ImageNotPublished(parent.to_string()));
        }

        let _parent_guard = image_lock(&self.cluster, parent)?
            .acquire_s()
            .await
            .map_err(no_such_image(parent))?;
        let parent_record = self
            .cluster
            .catalog()
            .get(parent)
            .await?
            .ok_or_else(|| BuildEnvError::NoSuchImage(parent.to_string()))?;

        let id = ImageId::new();
        let lock = image_lock(&self.cluster, &id)?;
        let guard = lock
            .create(true)
            .await?
            .ok_or_else(|| BuildEnvError::Internal("exclusive lock creation returned no guard".into()))?;

        let settings = self.cluster.settings();
        let volume = image_volume(settings, &id);
        let parent_volume = image_volume(settings, parent);
        let mut record = ImageRecord::new(id.clone(), comment, Some(parent.clone()));
        record.packages = parent_record.packages;

        let cloned = async {
            self.cluster
                .storage()
                .clone_snapshot(&parent_volume, FREEZE_SNAPSHOT, &volume)
                .await?;
            self.cluster.catalog().insert(&record).await
        }
        .await;

        if let Err(e) = cloned {
            self.roll_back(&id, &volume, &lock).await;
            return Err(e);
        }

        info!("Cloned image {} from {}", id, parent);
        Ok(Image::new(id, self.cluster.clone(), guard))
    }

    /// Open an existing image with its lock held in `mode`
    pub async fn open(&self, id: &ImageId, mode: LockMode) -> BuildEnvResult<Image> {
        let guard = image_lock(&self.cluster, id)?
            .acquire(mode)
            .await
            .map_err(no_such_image(id))?;

        // The image may have been deleted while we waited
        if self.cluster.catalog().get(id).await?.is_none() {
            return Err(BuildEnvError::NoSuchImage(id.to_string()));
        }
        debug!("Opened image {} in {}", id, mode);
        Ok(Image::new(id.clone(), self.cluster.clone(), guard))
    }

    /// Withdraw an image from cloning and drop its frozen snapshot
    ///
    /// Returns `false` if it was neither registered nor frozen.
    pub async fn unpublish(&self, id: &ImageId) -> BuildEnvResult<bool> {
        let registered = self.deregister(id).await?;

        let _guard = image_lock(&self.cluster, id)?
            .acquire_x()
            .await
            .map_err(no_such_image(id))?;
        // A clone in flight when we deregistered has finished by now
        self.refuse_if_cloned(id).await?;

        let volume = image_volume(self.cluster.settings(), id);
        let unfrozen = self.unfreeze(&volume).await?;
        if registered || unfrozen {
            info!("Unpublished image {}", id);
        }
        Ok(registered || unfrozen)
    }

    /// Remove an image with its snapshots, catalog entry and lock
    ///
    /// Returns `false` if the image was already gone.
    pub async fn delete(&self, id: &ImageId) -> BuildEnvResult<bool> {
        let lock = image_lock(&self.cluster, id)?;
        if !lock.exists().await? {
            debug!("Image {} has no lock, nothing to delete", id);
            return Ok(false);
        }

        self.deregister(id).await?;

        let guard = match lock.acquire_x().await {
            Ok(guard) => guard,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        self.refuse_if_cloned(id).await?;

        let volume = image_volume(self.cluster.settings(), id);
        let had_volume = destroy_volume(self.cluster.storage(), &volume).await?;
        let had_record = self.cluster.catalog().remove(id).await?;
        lock.remove().await?;
        drop(guard);

        info!("Deleted image {}", id);
        Ok(had_volume || had_record)
    }

    /// Every catalogued image, oldest first
    pub async fn list(&self) -> BuildEnvResult<Vec<ImageRecord>> {
        self.cluster.catalog().list().await
    }

    /// Ids currently registered as published
    pub async fn published(&self) -> BuildEnvResult<BTreeSet<ImageId>> {
        let _list = available_lock(&self.cluster)?.acquire_s().await?;
        self.cluster.catalog().published().await
    }

    async fn refuse_if_cloned(&self, id: &ImageId) -> BuildEnvResult<()> {
        let children = self.cluster.catalog().children(id).await?;
        if children.is_empty() {
            Ok(())
        } else {
            Err(BuildEnvError::ImageInUse {
                id: id.to_string(),
                children: children.len(),
            })
        }
    }

    /// Drop the registry entry under X of the list
    async fn deregister(&self, id: &ImageId) -> BuildEnvResult<bool> {
        let _list = available_lock(&self.cluster)?.acquire_x().await?;
        self.refuse_if_cloned(id).await?;
        self.cluster.catalog().set_published(id, false).await
    }

    async fn unfreeze(&self, volume: &Volume) -> BuildEnvResult<bool> {
        let storage = self.cluster.storage();
        if !storage.exists(volume).await? {
            return Ok(false);
        }
        let Some(freeze) = storage
            .snapshot_list(volume)
            .await?
            .into_iter()
            .find(|s| s.name == FREEZE_SNAPSHOT)
        else {
            return Ok(false);
        };

        if freeze.protected {
            storage.snapshot_unprotect(volume, FREEZE_SNAPSHOT).await?;
        }
        storage.snapshot_remove(volume, FREEZE_SNAPSHOT).await?;
        Ok(true)
    }

    /// Best-effort removal of a half-created image
    async fn roll_back(&self, id: &ImageId, volume: &Volume, lock: &Lock) {
        warn!("Rolling back creation of image {}", id);
        if let Err(e) = destroy_volume(self.cluster.storage(), volume).await {
            warn!("Rollback of image {}: removing {} failed: {}", id, volume, e);
        }
        if let Err(e) = self.cluster.catalog().remove(id).await {
            warn!("Rollback of image {}: removing catalog entry failed: {}", id, e);
        }
        if let Err(e) = lock.remove().await {
            warn!("Rollback of image {}: removing lock failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockPath, LockService};
    use crate::package::Package;
    use crate::storage::BlockStorage;
    use crate::testing::TestCluster;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, TestCluster, ImagePool) {
        let temp = TempDir::new().unwrap();
        let test = Cluster::for_tests(temp.path());
        let pool = ImagePool::new(test.cluster.clone());
        pool.init().await.unwrap();
        (temp, test, pool)
    }

    async fn published(pool: &ImagePool, packages: &[&str]) -> ImageId {
        let mut image = pool.create_empty(None).await.unwrap();
        image
            .install_packages(packages.iter().map(|p| Package::parse(p).unwrap()).collect::<Vec<_>>())
            .await
            .unwrap();
        image.publish().await.unwrap();
        image.id().clone()
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (_temp, _test, pool) = setup().await;
        pool.init().await.unwrap();
        assert!(pool.published().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_empty_formats_and_catalogues() {
        let (_temp, test, pool) = setup().await;
        let image = pool.create_empty(Some("base".into())).await.unwrap();

        assert_eq!(image.lock_mode(), LockMode::Exclusive);
        assert!(test.storage.exists(&image.volume()).await.unwrap());
        assert!(test.mounter.events()[0].starts_with("format"));
        assert_eq!(test.storage.mapped_count(), 0);

        let records = pool.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].comment.as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn failed_create_rolls_back() {
        let (_temp, test, pool) = setup().await;
        test.storage.fail_on("map");

        assert!(pool.create_empty(None).await.is_err());
        assert!(test.storage.volumes("images").is_empty());
        assert!(pool.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clone_requires_published_parent() {
        let (_temp, _test, pool) = setup().await;
        let parent = pool.create_empty(None).await.unwrap().id().clone();

        let err = pool.cow_clone(&parent, None).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::ImageNotPublished(_)));
        assert_eq!(pool.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clone_inherits_contents_and_catalog() {
        let (_temp, _test, pool) = setup().await;

        let mut base = pool.create_empty(None).await.unwrap();
        let dir = base.mount("prep").await.unwrap();
        std::fs::write(dir.join("usr"), "toolchain").unwrap();
        base.unmount("prep").await.unwrap();
        base.install_packages([Package::parse("gcc:amd64=12").unwrap()])
            .await
            .unwrap();
        base.publish().await.unwrap();
        let base_id = base.id().clone();
        drop(base);

        let mut child = pool.cow_clone(&base_id, Some("child".into())).await.unwrap();
        assert_eq!(child.lock_mode(), LockMode::Exclusive);
        let record = child.record().await.unwrap();
        assert_eq!(record.parent.as_ref(), Some(&base_id));
        assert_eq!(record.packages.len(), 1);

        let dir = child.mount("work").await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("usr")).unwrap(), "toolchain");
        child.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_clone_rolls_back() {
        let (_temp, test, pool) = setup().await;
        let parent = published(&pool, &[]).await;

        test.storage.fail_on("clone");
        assert!(pool.cow_clone(&parent, None).await.is_err());
        assert_eq!(pool.list().await.unwrap().len(), 1);
        assert_eq!(test.storage.volumes("images").len(), 1);
    }

    #[tokio::test]
    async fn open_unknown_image() {
        let (_temp, _test, pool) = setup().await;
        let err = pool.open(&ImageId::new(), LockMode::Shared).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::NoSuchImage(_)));
    }

    #[tokio::test]
    async fn unpublish_refuses_while_clones_exist() {
        let (_temp, _test, pool) = setup().await;
        let parent = published(&pool, &[]).await;
        let child = pool.cow_clone(&parent, None).await.unwrap().id().clone();

        let err = pool.unpublish(&parent).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::ImageInUse { children: 1, .. }));
        assert!(pool.published().await.unwrap().contains(&parent));

        assert!(pool.delete(&child).await.unwrap());
        assert!(pool.unpublish(&parent).await.unwrap());
        assert!(pool.published().await.unwrap().is_empty());
        assert!(!pool.unpublish(&parent).await.unwrap());

        let image = pool.open(&parent, LockMode::Shared).await.unwrap();
        assert!(!image.is_frozen().await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_child_row_blocks_parent_teardown() {
        let (temp, test, pool) = setup().await;
        let parent = published(&pool, &[]).await;
        let child = pool.cow_clone(&parent, None).await.unwrap().id().clone();

        let row = temp
            .path()
            .join("catalog")
            .join("images")
            .join(format!("{}.json", child));
        std::fs::write(&row, "{\"id\":").unwrap();

        let err = pool.delete(&parent).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::CatalogCorrupt { .. }));
        assert!(pool.unpublish(&parent).await.is_err());

        // Refused before anything changed
        assert!(pool.published().await.unwrap().contains(&parent));
        let volume = image_volume(test.cluster.settings(), &parent);
        assert_eq!(test.storage.snapshot_list(&volume).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_everything_once() {
        let (_temp, test, pool) = setup().await;
        let id = published(&pool, &["make:amd64=4.3"]).await;

        assert!(pool.delete(&id).await.unwrap());
        assert!(test.storage.volumes("images").is_empty());
        assert!(pool.list().await.unwrap().is_empty());
        assert!(pool.published().await.unwrap().is_empty());
        let lock = LockPath::new(format!("images/{}", id)).unwrap();
        assert!(!test.locks.exists(&lock).await.unwrap());

        assert!(!pool.delete(&id).await.unwrap());
        assert!(!pool.delete(&ImageId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn delete_refuses_published_parent_of_clone() {
        let (_temp, _test, pool) = setup().await;
        let parent = published(&pool, &[]).await;
        let _child = pool.cow_clone(&parent, None).await.unwrap();

        let err = pool.delete(&parent).await.unwrap_err();
        assert!(matches!(err, BuildEnvError::ImageInUse { .. }));
    }

    #[tokio::test]
    async fn concurrent_deletes_report_once() {
        let (_temp, _test, pool) = setup().await;
        let id = published(&pool, &[]).await;

        let (a, b) = tokio::join!(pool.delete(&id), pool.delete(&id));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|deleted| **deleted).count(), 1);
    }
}
