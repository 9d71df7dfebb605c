//! Ceph RBD block storage
//!
//! Implements the BlockStorage trait by running the `rbd` command line tool.
//! Only the exit status and the reported output are trusted.

use crate::error::{BuildEnvError, BuildEnvResult};
use crate::storage::{BlockStorage, SnapshotInfo, Volume};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Block storage using the `rbd` CLI
#[derive(Debug, Clone)]
pub struct RbdStorage {
    binary: String,
    client_id: Option<String>,
    conf: Option<PathBuf>,
}

/// Entry of `rbd snap ls --format json`
#[derive(Debug, Deserialize)]
struct RbdSnapshot {
    id: u64,
    name: String,
    #[serde(default)]
    protected: serde_json::Value,
}

impl RbdSnapshot {
    fn is_protected(&self) -> bool {
        match &self.protected {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => s == "true",
            _ => false,
        }
    }
}

impl RbdStorage {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            client_id: None,
            conf: None,
        }
    }

    /// Authenticate as `client.<id>`
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Use a specific ceph.conf
    pub fn with_conf(mut self, conf: impl Into<PathBuf>) -> Self {
        self.conf = Some(conf.into());
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(id) = &self.client_id {
            args.push("--id".to_string());
            args.push(id.clone());
        }
        if let Some(conf) = &self.conf {
            args.push("--conf".to_string());
            args.push(conf.display().to_string());
        }
        args
    }

    /// Execute an rbd command and return the raw output
    async fn exec(&self, args: &[&str]) -> BuildEnvResult<std::process::Output> {
        let mut full = self.base_args();
        full.extend(args.iter().map(|a| a.to_string()));
        debug!("Executing: {} {:?}", self.binary, full);

        Command::new(&self.binary)
            .args(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BuildEnvError::command_failed(format!("{} {:?}", self.binary, args), e))
    }

    /// Execute an rbd command that must succeed, returning stdout
    async fn run(&self, args: &[&str]) -> BuildEnvResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(BuildEnvError::external(
                format!("{} {}", self.binary, args.join(" ")),
                output.status,
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

impl Default for RbdStorage {
    fn default() -> Self {
        Self::new("rbd")
    }
}

fn is_enoent(output: &std::process::Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    output.status.code() == Some(2) || stderr.contains("No such file or directory")
}

#[async_trait]
impl BlockStorage for RbdStorage {
    async fn create(&self, volume: &Volume, size_mb: u64) -> BuildEnvResult<()> {
        info!("Creating volume {} ({} MB)", volume, size_mb);
        let size = size_mb.to_string();
        self.run(&["create", "--size", &size, &volume.spec(None)]).await?;
        Ok(())
    }

    async fn exists(&self, volume: &Volume) -> BuildEnvResult<bool> {
        let output = self.exec(&["info", &volume.spec(None)]).await?;
        if output.status.success() {
            Ok(true)
        } else if is_enoent(&output) {
            Ok(false)
        } else {
            Err(BuildEnvError::external(
                format!("{} info {}", self.binary, volume),
                output.status,
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn list(&self, pool: &str) -> BuildEnvResult<Vec<String>> {
        let stdout = self.run(&["ls", "--format", "json", pool]).await?;
        if stdout.trim().is_empty() {
            return Ok(vec![]);
        }
        let mut names: Vec<String> = serde_json::from_str(&stdout)?;
        names.sort();
        Ok(names)
    }

    async fn clone_snapshot(
        &self,
        parent: &Volume,
        snapshot: &str,
        child: &Volume,
    ) -> BuildEnvResult<()> {
        info!("Cloning {} to {}", parent.spec(Some(snapshot)), child);
        self.run(&["clone", &parent.spec(Some(snapshot)), &child.spec(None)])
            .await?;
        Ok(())
    }

    async fn map(
        &self,
        volume: &Volume,
        snapshot: Option<&str>,
        read_only: bool,
    ) -> BuildEnvResult<PathBuf> {
        let spec = volume.spec(snapshot);
        let mut args = vec!["device", "map"];
        if read_only {
            args.push("--read-only");
        }
        args.push(&spec);

        let stdout = self.run(&args).await?;
        let device = stdout.trim();
        if device.is_empty() {
            return Err(BuildEnvError::Internal(format!(
                "rbd map {} reported no device",
                spec
            )));
        }
        debug!("Mapped {} at {}", spec, device);
        Ok(PathBuf::from(device))
    }

    async fn unmap(&self, device: &Path) -> BuildEnvResult<()> {
        let device = device.display().to_string();
        self.run(&["device", "unmap", &device]).await?;
        Ok(())
    }

    async fn snapshot_create(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        info!("Creating snapshot {}", volume.spec(Some(snapshot)));
        self.run(&["snap", "create", &volume.spec(Some(snapshot))]).await?;
        Ok(())
    }

    async fn snapshot_list(&self, volume: &Volume) -> BuildEnvResult<Vec<SnapshotInfo>> {
        let stdout = self
            .run(&["snap", "ls", "--format", "json", &volume.spec(None)])
            .await?;
        if stdout.trim().is_empty() {
            return Ok(vec![]);
        }
        let mut snapshots: Vec<RbdSnapshot> = serde_json::from_str(&stdout)?;
        snapshots.sort_by_key(|s| s.id);
        Ok(snapshots
            .into_iter()
            .map(|s| SnapshotInfo {
                protected: s.is_protected(),
                name: s.name,
            })
            .collect())
    }

    async fn snapshot_remove(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        info!("Removing snapshot {}", volume.spec(Some(snapshot)));
        self.run(&["snap", "rm", "--no-progress", &volume.spec(Some(snapshot))])
            .await?;
        Ok(())
    }

    async fn snapshot_protect(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        self.run(&["snap", "protect", &volume.spec(Some(snapshot))]).await?;
        Ok(())
    }

    async fn snapshot_unprotect(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        self.run(&["snap", "unprotect", &volume.spec(Some(snapshot))]).await?;
        Ok(())
    }

    async fn snapshot_rollback(&self, volume: &Volume, snapshot: &str) -> BuildEnvResult<()> {
        info!("Rolling {} back to {}", volume, snapshot);
        self.run(&["snap", "rollback", "--no-progress", &volume.spec(Some(snapshot))])
            .await?;
        Ok(())
    }

    async fn remove(&self, volume: &Volume) -> BuildEnvResult<()> {
        info!("Removing volume {}", volume);
        self.run(&["rm", "--no-progress", &volume.spec(None)]).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "Ceph RBD"
    }
}
