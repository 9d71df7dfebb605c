//! Configuration schema for buildenv
//!
//! Configuration is stored at `~/.config/buildenv/config.toml`

use crate::config::ConfigManager;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Block storage settings
    pub storage: StorageConfig,

    /// Image settings
    pub images: ImagesConfig,

    /// Scratch space settings
    pub scratch: ScratchConfig,

    /// Lock service settings
    pub locks: LocksConfig,

    /// Image catalog settings
    pub catalog: CatalogConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Block storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path or name of the rbd binary
    pub rbd_binary: String,

    /// Ceph client id (`client.<id>`)
    pub client_id: Option<String>,

    /// ceph.conf to use instead of the default
    pub conf_path: Option<PathBuf>,

    /// Pool holding image volumes
    pub image_pool: String,

    /// Pool holding scratch volumes
    pub scratch_pool: String,

    /// Filesystem created on new volumes
    pub fs_type: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            rbd_binary: "rbd".to_string(),
            client_id: None,
            conf_path: None,
            image_pool: "buildenv-images".to_string(),
            scratch_pool: "buildenv-scratch".to_string(),
            fs_type: "ext4".to_string(),
        }
    }
}

/// Image configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Images mount at `<mount_root>/<namespace>/<id>`
    pub mount_root: PathBuf,

    /// Size of new empty images in MB
    pub size_mb: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/var/lib/buildenv/images"),
            size_mb: 20 * 1024,
        }
    }
}

/// Scratch space configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    /// Scratch spaces mount at `<mount_root>/<volume>`
    pub mount_root: PathBuf,

    /// Quota of new scratch spaces in MB
    pub size_mb: u64,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/var/lib/buildenv/scratch"),
            size_mb: 50 * 1024,
        }
    }
}

/// Lock service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Directory shared by every builder host
    pub dir: PathBuf,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            dir: ConfigManager::state_dir().join("locks"),
        }
    }
}

/// Catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory shared by every builder host
    pub dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: ConfigManager::state_dir().join("catalog"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[storage]"));
        assert!(toml.contains("[scratch]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.rbd_binary, "rbd");
        assert_eq!(config.storage.fs_type, "ext4");
        assert!(config.locks.dir.ends_with("locks"));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [storage]
            image_pool = "farm-images"
            client_id = "builder"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.image_pool, "farm-images");
        assert_eq!(config.storage.client_id.as_deref(), Some("builder"));
        assert_eq!(config.storage.scratch_pool, "buildenv-scratch"); // default preserved
        assert_eq!(config.images.size_mb, 20 * 1024);
    }
}
