//! Choosing the published image closest to a set of requirements

use crate::catalog::ImageRecord;
use crate::constraint::DependencyList;
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::image::{available_lock, ImageId, ImagePool};
use crate::package::{Package, PackageKey};
use futures_util::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// How far an image is from the requirements
///
/// Ordered by `penalty` (missing plus disruptive packages) first and only
/// then by `extras`, so a single missing or disruptive package always costs
/// more than any number of unrequested ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ImageCost {
    penalty: usize,
    extras: usize,
}

impl ImageCost {
    pub fn new(missing: usize, disruptive: usize, extras: usize) -> Self {
        Self {
            penalty: missing + disruptive,
            extras,
        }
    }

    pub fn penalty(&self) -> usize {
        self.penalty
    }

    pub fn extras(&self) -> usize {
        self.extras
    }

    /// Usable as-is: nothing missing and nothing in conflict
    pub fn is_exact(&self) -> bool {
        self.penalty == 0
    }

    /// Scalar form `penalty + 1 - 1/(extras + 1)`, for display only
    pub fn as_f64(&self) -> f64 {
        self.penalty as f64 + 1.0 - 1.0 / (self.extras as f64 + 1.0)
    }
}

impl fmt::Display for ImageCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.as_f64())
    }
}

/// An image scored against requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMatch {
    pub id: ImageId,
    pub cost: ImageCost,
    /// Required but not installed
    pub missing: BTreeSet<PackageKey>,
    /// Installed in a version the requirements exclude
    pub disruptive: BTreeSet<Package>,
    /// Installed but not required
    pub extras: BTreeSet<PackageKey>,
}

/// Score one image's package catalog
pub fn evaluate(record: &ImageRecord, requirements: &DependencyList) -> ImageMatch {
    let installed: BTreeSet<PackageKey> = record.packages.iter().map(Package::key).collect();

    let missing: BTreeSet<PackageKey> = requirements
        .get_required()
        .into_iter()
        .filter(|key| !installed.contains(key))
        .collect();

    let disruptive: BTreeSet<Package> = record
        .packages
        .iter()
        .filter(|p| {
            let key = p.key();
            requirements.is_required(&key) && !requirements.contains(&key, &p.version)
        })
        .cloned()
        .collect();

    let extras: BTreeSet<PackageKey> = installed
        .into_iter()
        .filter(|key| !requirements.is_required(key))
        .collect();

    ImageMatch {
        id: record.id.clone(),
        cost: ImageCost::new(missing.len(), disruptive.len(), extras.len()),
        missing,
        disruptive,
        extras,
    }
}

/// Lowest cost wins; equal costs go to the smallest id
pub fn best_match<'a>(
    records: impl IntoIterator<Item = &'a ImageRecord>,
    requirements: &DependencyList,
) -> Option<ImageMatch> {
    records
        .into_iter()
        .map(|record| evaluate(record, requirements))
        .min_by(|a, b| a.cost.cmp(&b.cost).then_with(|| a.id.cmp(&b.id)))
}

impl ImagePool {
    /// Best published image for `requirements`, or `None` if nothing is published
    pub async fn find_image(&self, requirements: &DependencyList) -> BuildEnvResult<Option<ImageMatch>> {
        let catalog = self.cluster().catalog();
        let _list = available_lock(self.cluster())?.acquire_s().await?;
        let published = catalog.published().await?;

        let records = try_join_all(published.iter().map(|id| async move {
            catalog
                .get(id)
                .await?
                .ok_or_else(|| BuildEnvError::NoSuchImage(id.to_string()))
        }))
        .await?;

        let found = best_match(&records, requirements);
        if let Some(found) = &found {
            debug!(
                "Best image {} (cost {}, {} missing, {} disruptive, {} extra)",
                found.id,
                found.cost,
                found.missing.len(),
                found.disruptive.len(),
                found.extras.len()
            );
        }
        Ok(found)
    }
}
