//! Catalog persisted as JSON files
//!
//! Layout under the catalog directory:
//!
//! ```text
//! images/<id>.json    one ImageRecord per image
//! published.json      sorted array of published ids
//! ```
//!
//! Files are written to a temporary name and renamed into place. Callers
//! serialize mutations through the image locks.

use crate::catalog::{Catalog, ImageRecord};
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::image::ImageId;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Catalog stored in a shared directory
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    root: PathBuf,
}

impl JsonCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn record_path(&self, id: &ImageId) -> PathBuf {
        self.images_dir().join(format!("{}.json", id))
    }

    fn published_path(&self) -> PathBuf {
        self.root.join("published.json")
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> BuildEnvResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BuildEnvError::io(format!("creating {}", parent.display()), e))?;
        }

        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_file_name(format!(".{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, content)
            .await
            .map_err(|e| BuildEnvError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| BuildEnvError::io(format!("replacing {}", path.display()), e))
    }

    async fn read_record(&self, path: &Path) -> BuildEnvResult<Option<ImageRecord>> {
        match fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                BuildEnvError::CatalogCorrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildEnvError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn write_published(&self, ids: &BTreeSet<ImageId>) -> BuildEnvResult<()> {
        self.write_json(&self.published_path(), ids).await
    }
}

#[async_trait]
impl Catalog for JsonCatalog {
    async fn insert(&self, record: &ImageRecord) -> BuildEnvResult<()> {
        let path = self.record_path(&record.id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BuildEnvError::Internal(format!(
                "image {} is already catalogued",
                record.id
            )));
        }
        debug!("Cataloguing image {}", record.id);
        self.write_json(&path, record).await
    }

    async fn get(&self, id: &ImageId) -> BuildEnvResult<Option<ImageRecord>> {
        self.read_record(&self.record_path(id)).await
    }

    async fn update(&self, record: &ImageRecord) -> BuildEnvResult<()> {
        let path = self.record_path(&record.id);
        if self.read_record(&path).await?.is_none() {
            return Err(BuildEnvError::NoSuchImage(record.id.to_string()));
        }
        self.write_json(&path, record).await
    }

    async fn remove(&self, id: &ImageId) -> BuildEnvResult<bool> {
        self.set_published(id, false).await?;

        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed catalog entry {}", id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BuildEnvError::io(format!("removing {}", path.display()), e)),
        }
    }

    async fn list(&self) -> BuildEnvResult<Vec<ImageRecord>> {
        let dir = self.images_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(BuildEnvError::io(format!("reading {}", dir.display()), e)),
        };

        let mut records = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BuildEnvError::io("reading catalog entry", e))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            // A row that cannot be read could be anyone's parent link
            if let Some(record) = self.read_record(&path).await? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn published(&self) -> BuildEnvResult<BTreeSet<ImageId>> {
        let path = self.published_path();
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(BuildEnvError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn set_published(&self, id: &ImageId, published: bool) -> BuildEnvResult<bool> {
        let mut ids = self.published().await?;
        let changed = if published {
            ids.insert(id.clone())
        } else {
            ids.remove(id)
        };
        if changed {
            debug!("Image {} published: {}", id, published);
            self.write_published(&ids).await?;
        }
        Ok(changed)
    }
}
