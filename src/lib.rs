//! buildenv - Copy-on-write build environments
//!
//! Keeps a pool of package-build images on Ceph RBD, picks the published
//! image closest to a build's requirements and hands out per-build scratch
//! volumes with revertible snapshots. Everything that touches shared state
//! is serialised through hierarchical S/S+/X locks.

pub mod catalog;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod constraint;
pub mod error;
pub mod image;
pub mod lock;
pub mod package;
pub mod scratch;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::{Cluster, Settings};
pub use constraint::{DependencyList, Relation, Version, VersionConstraint};
pub use error::{BuildEnvError, BuildEnvResult};
pub use image::{Image, ImageCost, ImageId, ImageMatch, ImagePool, ImageState};
pub use lock::{Lock, LockGuard, LockMode};
pub use package::{Package, PackageFilter, PackageKey};
pub use scratch::{ScratchSpace, ScratchSpacePool};
