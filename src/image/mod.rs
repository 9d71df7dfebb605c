//! Build images: package-bearing volumes that are frozen once published
//!
//! An image starts empty or as a COW clone of a published image, is changed
//! while its owner holds it exclusively, and is then published: a protected
//! `freeze` snapshot is taken and its id registered in the shared
//! available-list. Published images only ever mount read-only.

mod find;
mod pool;

pub use find::{best_match, evaluate, ImageCost, ImageMatch};
pub use pool::ImagePool;

use crate::catalog::ImageRecord;
use crate::cluster::{Cluster, Settings};
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::lock::{Lock, LockGuard, LockMode};
use crate::package::{Package, PackageFilter, PackageKey};
use crate::storage::{SnapshotInfo, Volume};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshot that holds a published image's immutable contents
pub const FREEZE_SNAPSHOT: &str = "freeze";

/// Lock guarding the registry of published images
pub const AVAILABLE_LOCK: &str = "images/available";

/// Opaque image identifier, ordered for deterministic tie-breaks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ImageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ImageId {
    type Err = BuildEnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| BuildEnvError::NoSuchImage(s.to_string()))
    }
}

/// Lifecycle state visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Private,
    Published,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Published => write!(f, "published"),
        }
    }
}

pub(crate) fn image_volume(settings: &Settings, id: &ImageId) -> Volume {
    Volume::new(&settings.image_pool, format!("image-{}", id))
}

pub(crate) fn available_lock(cluster: &Cluster) -> BuildEnvResult<Lock> {
    cluster.define_lock(AVAILABLE_LOCK)
}

pub(crate) fn image_lock(cluster: &Cluster, id: &ImageId) -> BuildEnvResult<Lock> {
    cluster.define_lock(format!("images/{}", id))
}

/// Report a missing lock as a missing image
pub(crate) fn no_such_image(id: &ImageId) -> impl Fn(BuildEnvError) -> BuildEnvError + '_ {
    move |e| match e {
        BuildEnvError::NoSuchLock(_) => BuildEnvError::NoSuchImage(id.to_string()),
        e => e,
    }
}

fn validate_namespace(namespace: &str) -> BuildEnvResult<()> {
    if namespace.is_empty()
        || namespace == "."
        || namespace == ".."
        || namespace.contains(['/', '\0'])
    {
        return Err(BuildEnvError::Internal(format!(
            "invalid mount namespace {:?}",
            namespace
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct ImageMount {
    device: PathBuf,
    target: PathBuf,
}

/// An open image, holding its lock for as long as it lives
pub struct Image {
    id: ImageId,
    cluster: Cluster,
    guard: LockGuard,
    mounts: BTreeMap<String, ImageMount>,
}

impl Image {
    pub(crate) fn new(id: ImageId, cluster: Cluster, guard: LockGuard) -> Self {
        Self {
            id,
            cluster,
            guard,
            mounts: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &ImageId {
        &self.id
    }

    pub fn lock_mode(&self) -> LockMode {
        self.guard.mode()
    }

    /// Upgrade an S+ handle to X
    pub async fn upgrade(&mut self) -> BuildEnvResult<()> {
        self.guard.upgrade().await
    }

    pub fn volume(&self) -> Volume {
        image_volume(self.cluster.settings(), &self.id)
    }

    pub async fn record(&self) -> BuildEnvResult<ImageRecord> {
        self.cluster
            .catalog()
            .get(&self.id)
            .await?
            .ok_or_else(|| BuildEnvError::NoSuchImage(self.id.to_string()))
    }

    pub async fn comment(&self) -> BuildEnvResult<Option<String>> {
        Ok(self.record().await?.comment)
    }

    /// Change the description; needs X but is allowed on published images
    pub async fn set_comment(&mut self, comment: Option<String>) -> BuildEnvResult<()> {
        self.guard.require(LockMode::Exclusive)?;
        let mut record = self.record().await?;
        record.comment = comment;
        self.cluster.catalog().update(&record).await
    }

    async fn freeze_snapshot(&self) -> BuildEnvResult<Option<SnapshotInfo>> {
        Ok(self
            .cluster
            .storage()
            .snapshot_list(&self.volume())
            .await?
            .into_iter()
            .find(|s| s.name == FREEZE_SNAPSHOT))
    }

    /// Whether the `freeze` snapshot exists
    pub async fn is_frozen(&self) -> BuildEnvResult<bool> {
        Ok(self.freeze_snapshot().await?.is_some())
    }

    pub async fn state(&self) -> BuildEnvResult<ImageState> {
        let published = self.cluster.catalog().published().await?;
        if published.contains(&self.id) && self.is_frozen().await? {
            Ok(ImageState::Published)
        } else {
            Ok(ImageState::Private)
        }
    }

    /// Freeze the image and register it for cloning
    ///
    /// Requires X and no live mounts. Calling it again is a no-op.
    pub async fn publish(&mut self) -> BuildEnvResult<()> {
        self.guard.require(LockMode::Exclusive)?;
        if let Some(namespace) = self.mounts.keys().next() {
            return Err(BuildEnvError::ImageAlreadyMounted {
                id: self.id.to_string(),
                namespace: namespace.clone(),
            });
        }

        let storage = self.cluster.storage();
        let volume = self.volume();
        match self.freeze_snapshot().await? {
            None => {
                storage.snapshot_create(&volume, FREEZE_SNAPSHOT).await?;
                storage.snapshot_protect(&volume, FREEZE_SNAPSHOT).await?;
            }
            Some(snapshot) if !snapshot.protected => {
                storage.snapshot_protect(&volume, FREEZE_SNAPSHOT).await?;
            }
            Some(_) => debug!("Image {} is already frozen", self.id),
        }

        // Re-publishing must not wait for X while cloners hold S
        let list = available_lock(&self.cluster)?;
        {
            let _list = list.acquire_s().await?;
            if self.cluster.catalog().published().await?.contains(&self.id) {
                return Ok(());
            }
        }
        let _list = list.acquire_x().await?;
        if self.cluster.catalog().set_published(&self.id, true).await? {
            info!("Published image {}", self.id);
        }
        Ok(())
    }

    pub fn mount_path(&self, namespace: &str) -> PathBuf {
        self.cluster
            .settings()
            .image_mount_root
            .join(namespace)
            .join(self.id.to_string())
    }

    /// Namespaces this handle has the image mounted in
    pub fn mounted_namespaces(&self) -> impl Iterator<Item = &str> {
        self.mounts.keys().map(String::as_str)
    }

    /// Mount under `<mount_root>/<namespace>/<id>`
    ///
    /// Frozen images mount their `freeze` snapshot read-only. Otherwise the
    /// live volume is mounted read-write, which requires X.
    pub async fn mount(&mut self, namespace: &str) -> BuildEnvResult<PathBuf> {
        validate_namespace(namespace)?;
        let already_mounted = || BuildEnvError::ImageAlreadyMounted {
            id: self.id.to_string(),
            namespace: namespace.to_string(),
        };
        if self.mounts.contains_key(namespace) {
            return Err(already_mounted());
        }

        let target = self.mount_path(namespace);
        if self.cluster.mounter().is_mounted(&target).await? {
            return Err(already_mounted());
        }

        let (snapshot, read_only) = if self.is_frozen().await? {
            (Some(FREEZE_SNAPSHOT), true)
        } else {
            self.guard
                .require(LockMode::Exclusive)
                .map_err(|_| BuildEnvError::NotWritable(format!("image {}", self.id)))?;
            (None, false)
        };

        let storage = self.cluster.storage();
        let volume = self.volume();
        let device = storage.map(&volume, snapshot, read_only).await?;
        if let Err(e) = self.cluster.mounter().mount(&device, &target, read_only).await {
            if let Err(unmap) = storage.unmap(&device).await {
                warn!("Failed to unmap {} after mount failure: {}", device.display(), unmap);
            }
            return Err(e);
        }

        info!(
            "Mounted image {} at {}{}",
            self.id,
            target.display(),
            if read_only { " (read-only)" } else { "" }
        );
        self.mounts.insert(
            namespace.to_string(),
            ImageMount {
                device,
                target: target.clone(),
            },
        );
        Ok(target)
    }

    pub async fn unmount(&mut self, namespace: &str) -> BuildEnvResult<()> {
        let mount = self
            .mounts
            .get(namespace)
            .cloned()
            .ok_or_else(|| BuildEnvError::ImageNotMounted {
                id: self.id.to_string(),
                namespace: namespace.to_string(),
            })?;

        self.cluster.mounter().umount(&mount.target).await?;
        self.mounts.remove(namespace);
        self.cluster.storage().unmap(&mount.device).await?;

        // Empty mount points only; a busy namespace directory stays
        for dir in [Some(mount.target.as_path()), mount.target.parent()]
            .into_iter()
            .flatten()
        {
            tokio::fs::remove_dir(dir).await.ok();
        }
        info!("Unmounted image {} from {}", self.id, namespace);
        Ok(())
    }

    pub async fn query_packages(&self, filter: &PackageFilter) -> BuildEnvResult<Vec<Package>> {
        Ok(self
            .record()
            .await?
            .packages
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect())
    }

    async fn require_mutable(&self) -> BuildEnvResult<()> {
        self.guard
            .require(LockMode::Exclusive)
            .map_err(|_| BuildEnvError::NotWritable(format!("image {}", self.id)))?;
        if self.is_frozen().await? {
            return Err(BuildEnvError::NotWritable(format!(
                "published image {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Record packages as installed, replacing other versions of the same key
    pub async fn install_packages(
        &mut self,
        packages: impl IntoIterator<Item = Package> + Send,
    ) -> BuildEnvResult<()> {
        self.require_mutable().await?;
        let mut record = self.record().await?;
        for package in packages {
            let key = package.key();
            record.packages.retain(|p| p.key() != key);
            debug!("Image {}: recording {}", self.id, package);
            record.packages.insert(package);
        }
        self.cluster.catalog().update(&record).await
    }

    /// Forget packages; returns how many were removed
    pub async fn remove_packages(&mut self, keys: &[PackageKey]) -> BuildEnvResult<usize> {
        self.require_mutable().await?;
        let mut record = self.record().await?;
        let before = record.packages.len();
        record.packages.retain(|p| !keys.contains(&p.key()));
        let removed = before - record.packages.len();
        if removed > 0 {
            self.cluster.catalog().update(&record).await?;
        }
        Ok(removed)
    }

    /// Unmount everything and release the lock
    pub async fn close(mut self) -> BuildEnvResult<()> {
        let namespaces: Vec<String> = self.mounts.keys().cloned().collect();
        let mut first_error = None;
        for namespace in namespaces {
            if let Err(e) = self.unmount(&namespace).await {
                warn!("Failed to unmount image {} from {}: {}", self.id, namespace, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if !self.mounts.is_empty() {
            warn!(
                "Image {} released while still mounted in {:?}",
                self.id,
                self.mounts.keys().collect::<Vec<_>>()
            );
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("mode", &self.guard.mode())
            .field("mounts", &self.mounts.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn pkg(s: &str) -> Package {
        Package::parse(s).unwrap()
    }

    #[test]
    fn image_id_roundtrip() {
        let id = ImageId::new();
        assert_eq!(id.to_string().parse::<ImageId>().unwrap(), id);
        assert!("not-a-uuid".parse::<ImageId>().is_err());
    }

    #[tokio::test]
    async fn publish_twice_leaves_one_snapshot_and_entry() {
        let (_temp, test, pool) = setup().await;
        let mut image = pool.create_empty(Some("base".into())).await.unwrap();

        image.publish().await.unwrap();
        image.publish().await.unwrap();

        let snapshots = test.storage.snapshot_list(&image.volume()).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].protected);
        assert_eq!(pool.published().await.unwrap().len(), 1);
        assert_eq!(image.state().await.unwrap(), ImageState::Published);
    }

    #[tokio::test]
    async fn private_image_mounts_read_write_only_with_x() {
        let (_temp, test, pool) = setup().await;
        let mut image = pool.create_empty(None).await.unwrap();

        let path = image.mount("build-1").await.unwrap();
        assert_eq!(path, image.mount_path("build-1"));
        assert_eq!(test.mounter.is_read_only(&path), Some(false));
        std::fs::write(path.join("marker"), "x").unwrap();

        assert!(matches!(
            image.mount("build-1").await,
            Err(BuildEnvError::ImageAlreadyMounted { .. })
        ));
        image.unmount("build-1").await.unwrap();
        assert!(matches!(
            image.unmount("build-1").await,
            Err(BuildEnvError::ImageNotMounted { .. })
        ));
        let id = image.id().clone();
        drop(image);

        let mut reader = pool.open(&id, LockMode::Shared).await.unwrap();
        assert!(matches!(
            reader.mount("build-2").await,
            Err(BuildEnvError::NotWritable(_))
        ));
        assert_eq!(test.storage.mapped_count(), 0);
    }

    #[tokio::test]
    async fn published_image_mounts_read_only_in_many_namespaces() {
        let (_temp, test, pool) = setup().await;
        let mut image = pool.create_empty(None).await.unwrap();
        let path = image.mount("prep").await.unwrap();
        std::fs::write(path.join("content"), "frozen").unwrap();
        image.unmount("prep").await.unwrap();
        image.publish().await.unwrap();
        let id = image.id().clone();
        drop(image);

        let mut a = pool.open(&id, LockMode::Shared).await.unwrap();
        let mut b = pool.open(&id, LockMode::Shared).await.unwrap();
        let pa = a.mount("build-a").await.unwrap();
        let pb = b.mount("build-b").await.unwrap();
        assert_eq!(test.mounter.is_read_only(&pa), Some(true));
        assert_eq!(std::fs::read_to_string(pb.join("content")).unwrap(), "frozen");

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(test.storage.mapped_count(), 0);
    }

    #[tokio::test]
    async fn publish_refuses_while_mounted() {
        let (_temp, _test, pool) = setup().await;
        let mut image = pool.create_empty(None).await.unwrap();
        image.mount("ns").await.unwrap();
        assert!(matches!(
            image.publish().await,
            Err(BuildEnvError::ImageAlreadyMounted { .. })
        ));
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn package_catalog_mutation() {
        let (_temp, _test, pool) = setup().await;
        let mut image = pool.create_empty(None).await.unwrap();

        image
            .install_packages([pkg("gcc:amd64=12.2"), pkg("make:amd64=4.3")])
            .await
            .unwrap();
        image.install_packages([pkg("gcc:amd64=13.1")]).await.unwrap();

        let gcc = image.query_packages(&PackageFilter::name("gcc")).await.unwrap();
        assert_eq!(gcc, vec![pkg("gcc:amd64=13.1")]);
        assert_eq!(image.query_packages(&PackageFilter::default()).await.unwrap().len(), 2);

        let removed = image
            .remove_packages(&[PackageKey::new("make", "amd64")])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        image.set_comment(Some("toolchain".into())).await.unwrap();
        assert_eq!(image.comment().await.unwrap().as_deref(), Some("toolchain"));

        image.publish().await.unwrap();
        assert!(matches!(
            image.install_packages([pkg("gdb:amd64=13")]).await,
            Err(BuildEnvError::NotWritable(_))
        ));
    }

    #[tokio::test]
    async fn shared_handle_cannot_mutate() {
        let (_temp, _test, pool) = setup().await;
        let id = pool.create_empty(None).await.unwrap().id().clone();

        let mut reader = pool.open(&id, LockMode::Shared).await.unwrap();
        assert!(reader.install_packages([pkg("a:all=1")]).await.is_err());
        assert!(reader.publish().await.is_err());
        drop(reader);

        let mut writer = pool.open(&id, LockMode::SharedUpgrade).await.unwrap();
        writer.upgrade().await.unwrap();
        writer.install_packages([pkg("a:all=1")]).await.unwrap();
    }
}
