//! Image catalog: per-image metadata and the published-image registry
//!
//! Storage knows volumes and snapshots. Everything else about an image
//! (its comment, parent and installed packages) lives here, along with the
//! set of ids that are currently published for cloning.

mod json;

pub use json::JsonCatalog;

use crate::error::BuildEnvResult;
use crate::image::ImageId;
use crate::package::Package;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Metadata kept for every image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Image this one was cloned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ImageId>,

    pub created_at: DateTime<Utc>,

    /// Installed packages
    #[serde(default)]
    pub packages: BTreeSet<Package>,
}

impl ImageRecord {
    pub fn new(id: ImageId, comment: Option<String>, parent: Option<ImageId>) -> Self {
        Self {
            id,
            comment,
            parent,
            created_at: Utc::now(),
            packages: BTreeSet::new(),
        }
    }
}

/// Persistent image metadata
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Store a new record
    async fn insert(&self, record: &ImageRecord) -> BuildEnvResult<()>;

    async fn get(&self, id: &ImageId) -> BuildEnvResult<Option<ImageRecord>>;

    /// Replace an existing record
    async fn update(&self, record: &ImageRecord) -> BuildEnvResult<()>;

    /// Forget a record and its registration; `false` if it was unknown
    async fn remove(&self, id: &ImageId) -> BuildEnvResult<bool>;

    /// All records, oldest first
    async fn list(&self) -> BuildEnvResult<Vec<ImageRecord>>;

    /// Ids registered as published
    async fn published(&self) -> BuildEnvResult<BTreeSet<ImageId>>;

    /// Add or drop a registration; `true` if the registry changed
    async fn set_published(&self, id: &ImageId, published: bool) -> BuildEnvResult<bool>;

    /// Images cloned from `id`
    async fn children(&self, id: &ImageId) -> BuildEnvResult<Vec<ImageId>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.parent.as_ref() == Some(id))
            .map(|record| record.id)
            .collect())
    }
}
