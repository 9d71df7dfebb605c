//! In-process stand-ins for the farm services
//!
//! [`FakeStorage`] keeps every volume as a directory and every snapshot as a
//! copy of it. Mapping a volume hands out that directory as the "device".
//! [`FakeMounter`] mounts by symlinking the target to the device, so files
//! written under a mount path land in the volume.
//!
//! Both refuse what the real tools refuse (removing a mapped volume,
//! unprotecting a snapshot with clones, rolling back a mapped volume), which
//! keeps callers honest about ordering.

use crate::catalog::JsonCatalog;
use crate::cluster::{Cluster, Settings};
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::storage::{BlockStorage, Mounter, SnapshotInfo, Volume};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub use crate::lock::MemoryLockService;

fn refused(command: impl Into<String>, reason: impl Into<String>) -> BuildEnvError {
    BuildEnvError::ExternalCommand {
        command: command.into(),
        status: "exit code 1".to_string(),
        stderr: reason.into(),
    }
}

fn io(context: &str, path: &Path, e: std::io::Error) -> BuildEnvError {
    BuildEnvError::io(format!("{} {}", context, path.display()), e)
}

fn copy_dir(from: &Path, to: &Path) -> BuildEnvResult<()> {
    fs::create_dir_all(to).map_err(|e| io("creating", to, e))?;
    for entry in fs::read_dir(from).map_err(|e| io("reading", from, e))? {
        let entry = entry.map_err(|e| io("reading", from, e))?;
        let target = to.join(entry.file_name());
        let kind = entry.file_type().map_err(|e| io("inspecting", &entry.path(), e))?;
        if kind.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| io("copying", &entry.path(), e))?;
        }
    }
    Ok(())
}

fn replace_dir(from: &Path, to: &Path) -> BuildEnvResult<()> {
    if to.exists() {
        fs::remove_dir_all(to).map_err(|e| io("removing", to, e))?;
    }
    copy_dir(from, to)
}

#[derive(Debug, Default)]
struct FakeVolume {
    snapshots: Vec<SnapshotInfo>,
    parent: Option<(Volume, String)>,
}

#[derive(Debug)]
struct Mapping {
    device: PathBuf,
    volume: Volume,
    snapshot: Option<String>,
}

#[derive(Debug, Default)]
struct StorageState {
    volumes: BTreeMap<Volume, FakeVolume>,
    mapped: Vec<Mapping>,
    failing: HashSet<String>,
}

/// Directory-backed block storage
#[derive(Debug)]
pub struct FakeStorage {
    root: PathBuf,
    state: Mutex<StorageState>,
}

impl FakeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, StorageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn data_dir(&self, volume: &Volume) -> PathBuf {
        self.root.join(&volume.pool).join(&volume.name).join("data")
    }

    fn snapshot_dir(&self, volume: &Volume, snapshot: &str) -> PathBuf {
        self.root
            .join(&volume.pool)
            .join(&volume.name)
            .join("snaps")
            .join(snapshot)
    }

    /// Make every later call of `operation` fail (e.g. `"map"`)
    pub fn fail_on(&self, operation: &str) {
        self.state().failing.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    /// Number of live mappings
    pub fn mapped_count(&self) -> usize {
        self.state().mapped.len()
    }

    /// Names of all volumes in a pool
    pub fn volumes(&self, pool: &str) -> Vec<String> {
        self.state()
            .volumes
            .keys()
            .filter(|v| v.pool == pool)
            .map(|v| v.name.clone())
            .collect()
    }

    fn check(state: &StorageState, operation: &str) -> BuildEnvResult<()> {
        if state.failing.contains(operation) {
            Err(refused(operation, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn volume<'a>(
        state: &'a mut StorageState,
        operation: &str,
        volume: &Volume,
    ) -> BuildEnvResult<&'a mut FakeVolume> {
        state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| refused(format!("{} {}", operation, volume), "No such file or directory"))
    }

    fn snapshot_index(
        vol: &FakeVolume,
        operation: &str,
        volume: &Volume,
        snapshot: &str,
    ) -> BuildEnvResult<usize> {
        vol.snapshots
            .iter()
            .position(|s| s.name == snapshot)
            .ok_or_else(|| {
                refused(
                    format!("{} {}", operation, volume.spec(Some(snapshot))),
                    "No such file or directory",
                )
            })
    }
}

#[async_trait]
impl BlockStorage for FakeStorage {
    async fn create(&self, volume: &Volume, _size_mb: u64) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "create")?;
        if state.volumes.contains_key(volume) {
            return Err(refused(format!("create {}", volume), "File exists"));
        }
        let dir = self.data_dir(volume);
        fs::create_dir_all(&dir).map_err(|e| io("creating", &dir, e))?;
        state.volumes.insert(volume.clone(), FakeVolume::default());
        Ok(())
    }

    async fn exists(&self, volume: &Volume) -> BuildEnvResult<bool> {
        let state = self.state();
        Self::check(&state, "exists")?;
        Ok(state.volumes.contains_key(volume))
    }

    async fn list(&self, pool: &str) -> BuildEnvResult<Vec<String>> {
        Self::check(&self.state(), "list")?;
        Ok(self.volumes(pool))
    }

    async fn clone_snapshot(
        &self,
        parent: &Volume,
        snapshot: &str,
        child: &Volume,
    ) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "clone")?;
        let command = format!("clone {} {}", parent.spec(Some(snapshot)), child);

        let vol = Self::volume(&mut state, "clone", parent)?;
        let index = Self::snapshot_index(vol, "clone", parent, snapshot)?;
        if !vol.snapshots[index].protected {
            return Err(refused(command, "parent snapshot must be protected"));
        }
        if state.volumes.contains_key(child) {
            return Err(refused(command, "File exists"));
        }

        copy_dir(&self.snapshot_dir(parent, snapshot), &self.data_dir(child))?;
        state.volumes.insert(
            child.clone(),
            FakeVolume {
                snapshots: vec![],
                parent: Some((parent.clone(), snapshot.to_string())),
            },
        );
        Ok(())
    }

    async fn map(
        &self,
        volume: &Volume,
        snapshot: Option<&str>,
        _read_only: bool,
    ) -> BuildEnvResult<PathBuf> {
        let mut state = self.state();
        Self::check(&state, "map")?;
        let vol = Self::volume(&mut state, "map", volume)?;
        let device = match snapshot {
            Some(snapshot) => {
                Self::snapshot_index(vol, "map", volume, snapshot)?;
                self.snapshot_dir(volume, snapshot)
            }
            None => self.data_dir(volume),
        };
        state.mapped.push(Mapping {
            device: device.clone(),
            volume: volume.clone(),
            snapshot: snapshot.map(str::to_string),
        });
        Ok(device)
    }

    async fn unmap(&self, device: &Path) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "unmap")?;
        let index = state
            .mapped
            .iter()
            .position(|m| m.device == device)
            .ok_or_else(|| refused(format!("unmap {}", device.display()), "not mapped"))?;
        state.mapped.remove(index);
        Ok(())
    }

    async fn snapshot_create(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "snapshot_create")?;
        let vol = Self::volume(&mut state, "snap create", volume)?;
        if vol.snapshots.iter().any(|s| s.name == snapshot) {
            return Err(refused(
                format!("snap create {}", volume.spec(Some(snapshot))),
                "File exists",
            ));
        }
        copy_dir(&self.data_dir(volume), &self.snapshot_dir(volume, snapshot))?;
        vol.snapshots.push(SnapshotInfo {
            name: snapshot.to_string(),
            protected: false,
        });
        Ok(())
    }

    async fn snapshot_list(&self, volume: &Volume) -> BuildEnvResult<Vec<SnapshotInfo>> {
        let mut state = self.state();
        Self::check(&state, "snapshot_list")?;
        Ok(Self::volume(&mut state, "snap ls", volume)?.snapshots.clone())
    }

    async fn snapshot_remove(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "snapshot_remove")?;
        let in_use = state
            .mapped
            .iter()
            .any(|m| &m.volume == volume && m.snapshot.as_deref() == Some(snapshot));
        let vol = Self::volume(&mut state, "snap rm", volume)?;
        let index = Self::snapshot_index(vol, "snap rm", volume, snapshot)?;
        let command = format!("snap rm {}", volume.spec(Some(snapshot)));
        if vol.snapshots[index].protected {
            return Err(refused(command, "snapshot is protected"));
        }
        if in_use {
            return Err(refused(command, "snapshot is mapped"));
        }
        vol.snapshots.remove(index);
        let dir = self.snapshot_dir(volume, snapshot);
        fs::remove_dir_all(&dir).map_err(|e| io("removing", &dir, e))?;
        Ok(())
    }

    async fn snapshot_protect(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "snapshot_protect")?;
        let vol = Self::volume(&mut state, "snap protect", volume)?;
        let index = Self::snapshot_index(vol, "snap protect", volume, snapshot)?;
        if vol.snapshots[index].protected {
            return Err(refused(
                format!("snap protect {}", volume.spec(Some(snapshot))),
                "Device or resource busy",
            ));
        }
        vol.snapshots[index].protected = true;
        Ok(())
    }

    async fn snapshot_unprotect(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "snapshot_unprotect")?;
        let command = format!("snap unprotect {}", volume.spec(Some(snapshot)));
        let has_children = state.volumes.values().any(|v| {
            v.parent
                .as_ref()
                .is_some_and(|(p, s)| p == volume && s == snapshot)
        });
        let vol = Self::volume(&mut state, "snap unprotect", volume)?;
        let index = Self::snapshot_index(vol, "snap unprotect", volume, snapshot)?;
        if !vol.snapshots[index].protected {
            return Err(refused(command, "snapshot is not protected"));
        }
        if has_children {
            return Err(refused(command, "snapshot has clones"));
        }
        vol.snapshots[index].protected = false;
        Ok(())
    }

    async fn snapshot_rollback(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "snapshot_rollback")?;
        let command = format!("snap rollback {}", volume.spec(Some(snapshot)));
        if state
            .mapped
            .iter()
            .any(|m| &m.volume == volume && m.snapshot.is_none())
        {
            return Err(refused(command, "image is mapped"));
        }
        let vol = Self::volume(&mut state, "snap rollback", volume)?;
        Self::snapshot_index(vol, "snap rollback", volume, snapshot)?;
        replace_dir(&self.snapshot_dir(volume, snapshot), &self.data_dir(volume))
    }

    async fn remove(&self, volume: &Volume) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::check(&state, "remove")?;
        let command = format!("rm {}", volume);
        if state.mapped.iter().any(|m| &m.volume == volume) {
            return Err(refused(command, "image is mapped"));
        }
        let vol = Self::volume(&mut state, "rm", volume)?;
        if !vol.snapshots.is_empty() {
            return Err(refused(command, "image has snapshots"));
        }
        state.volumes.remove(volume);
        let dir = self.root.join(&volume.pool).join(&volume.name);
        fs::remove_dir_all(&dir).map_err(|e| io("removing", &dir, e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}

#[derive(Debug, Default)]
struct MounterState {
    mounts: HashMap<PathBuf, (PathBuf, bool)>,
    events: Vec<String>,
}

/// Mounter that symlinks mount points to device directories
#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<MounterState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MounterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recorded `format`, `mount`, `umount`, `freeze` and `thaw` calls
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    /// Whether `target` is mounted read-only
    pub fn is_read_only(&self, target: &Path) -> Option<bool> {
        self.state().mounts.get(target).map(|(_, ro)| *ro)
    }

    fn require_mounted(state: &MounterState, operation: &str, target: &Path) -> BuildEnvResult<()> {
        if state.mounts.contains_key(target) {
            Ok(())
        } else {
            Err(refused(
                format!("{} {}", operation, target.display()),
                "not mounted",
            ))
        }
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn format(&self, device: &Path, fs_type: &str) -> BuildEnvResult<()> {
        let mut state = self.state();
        if !device.is_dir() {
            return Err(refused(
                format!("mkfs.{} {}", fs_type, device.display()),
                "No such device",
            ));
        }
        for entry in fs::read_dir(device).map_err(|e| io("reading", device, e))? {
            let path = entry.map_err(|e| io("reading", device, e))?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path).map_err(|e| io("removing", &path, e))?;
            } else {
                fs::remove_file(&path).map_err(|e| io("removing", &path, e))?;
            }
        }
        state.events.push(format!("format {}", device.display()));
        Ok(())
    }

    async fn mount(&self, device: &Path, target: &Path, read_only: bool) -> BuildEnvResult<()> {
        let mut state = self.state();
        if state.mounts.contains_key(target) {
            return Err(refused(
                format!("mount {}", target.display()),
                "already mounted",
            ));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io("creating", parent, e))?;
        }
        // mount(8) mounts over an existing empty directory
        if target.is_dir() {
            fs::remove_dir(target).map_err(|e| io("replacing", target, e))?;
        }
        std::os::unix::fs::symlink(device, target).map_err(|e| io("linking", target, e))?;
        state
            .mounts
            .insert(target.to_path_buf(), (device.to_path_buf(), read_only));
        state.events.push(format!("mount {}", target.display()));
        Ok(())
    }

    async fn umount(&self, target: &Path) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::require_mounted(&state, "umount", target)?;
        fs::remove_file(target).map_err(|e| io("unlinking", target, e))?;
        state.mounts.remove(target);
        state.events.push(format!("umount {}", target.display()));
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> BuildEnvResult<bool> {
        Ok(self.state().mounts.contains_key(target))
    }

    async fn freeze(&self, target: &Path) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::require_mounted(&state, "fsfreeze --freeze", target)?;
        state.events.push(format!("freeze {}", target.display()));
        Ok(())
    }

    async fn thaw(&self, target: &Path) -> BuildEnvResult<()> {
        let mut state = self.state();
        Self::require_mounted(&state, "fsfreeze --unfreeze", target)?;
        state.events.push(format!("thaw {}", target.display()));
        Ok(())
    }
}

/// A cluster wired to fakes, plus handles on them for assertions
pub struct TestCluster {
    pub cluster: Cluster,
    pub locks: MemoryLockService,
    pub storage: Arc<FakeStorage>,
    pub mounter: Arc<FakeMounter>,
}

impl Cluster {
    /// Cluster on fakes rooted at `root` (volumes, catalog and mount points)
    pub fn for_tests(root: &Path) -> TestCluster {
        let locks = MemoryLockService::new();
        let storage = Arc::new(FakeStorage::new(root.join("volumes")));
        let mounter = Arc::new(FakeMounter::new());
        let settings = Settings {
            image_pool: "images".to_string(),
            scratch_pool: "scratch".to_string(),
            fs_type: "fake".to_string(),
            image_mount_root: root.join("mnt").join("images"),
            image_size_mb: 16,
            scratch_mount_root: root.join("mnt").join("scratch"),
            scratch_size_mb: 16,
        };

        let cluster = Cluster::new(
            Arc::new(locks.clone()),
            storage.clone(),
            mounter.clone(),
            Arc::new(JsonCatalog::new(root.join("catalog"))),
            settings,
        );

        TestCluster {
            cluster,
            locks,
            storage,
            mounter,
        }
    }
}
