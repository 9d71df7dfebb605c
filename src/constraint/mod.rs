//! Version constraint algebra
//!
//! Expresses "which package versions satisfy these requirements" compactly
//! enough to pick an existing build environment instead of building one.

pub mod list;
pub mod relation;
pub mod version;

pub use list::{parse_requirement, DependencyList};
pub use relation::{Relation, VersionConstraint};
pub use version::Version;
