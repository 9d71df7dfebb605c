//! Host mounting through the standard util-linux tools

use crate::error::{BuildEnvError, BuildEnvResult};
use crate::storage::Mounter;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Mounter using `mkfs.<fs>`, `mount`, `umount` and `fsfreeze`
#[derive(Debug, Clone)]
pub struct SystemMounter {
    mounts_table: PathBuf,
}

impl SystemMounter {
    pub fn new() -> Self {
        Self {
            mounts_table: PathBuf::from("/proc/self/mounts"),
        }
    }

    /// Read mount points from another table (e.g. a saved copy)
    pub fn with_mounts_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_table = path.into();
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> BuildEnvResult<()> {
        debug!("Executing: {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BuildEnvError::command_failed(program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(BuildEnvError::external(
                format!("{} {}", program, args.join(" ")),
                output.status,
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Undo the octal escapes the kernel uses for blanks in mount points
fn unescape_mount_point(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Whether `target` appears as a mount point in a mounts table
fn table_contains(table: &str, target: &Path) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| Path::new(&unescape_mount_point(mount_point)) == target)
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn format(&self, device: &Path, fs_type: &str) -> BuildEnvResult<()> {
        info!("Creating {} filesystem on {}", fs_type, device.display());
        let program = format!("mkfs.{}", fs_type);
        let device = device.display().to_string();
        self.run(&program, &["-q", &device]).await
    }

    async fn mount(&self, device: &Path, target: &Path, read_only: bool) -> BuildEnvResult<()> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| BuildEnvError::io(format!("creating {}", target.display()), e))?;

        info!(
            "Mounting {} at {}{}",
            device.display(),
            target.display(),
            if read_only { " (read-only)" } else { "" }
        );
        let device = device.display().to_string();
        let target = target.display().to_string();
        let mut args = vec![];
        if read_only {
            args.extend(["-o", "ro"]);
        }
        args.extend([device.as_str(), target.as_str()]);
        self.run("mount", &args).await
    }

    async fn umount(&self, target: &Path) -> BuildEnvResult<()> {
        info!("Unmounting {}", target.display());
        let target = target.display().to_string();
        self.run("umount", &[&target]).await
    }

    async fn is_mounted(&self, target: &Path) -> BuildEnvResult<bool> {
        let table = tokio::fs::read_to_string(&self.mounts_table)
            .await
            .map_err(|e| BuildEnvError::io(format!("reading {}", self.mounts_table.display()), e))?;
        Ok(table_contains(&table, target))
    }

    async fn freeze(&self, target: &Path) -> BuildEnvResult<()> {
        debug!("Freezing {}", target.display());
        let target = target.display().to_string();
        self.run("fsfreeze", &["--freeze", &target]).await
    }

    async fn thaw(&self, target: &Path) -> BuildEnvResult<()> {
        debug!("Thawing {}", target.display());
        let target = target.display().to_string();
        self.run("fsfreeze", &["--unfreeze", &target]).await
    }
}
