//! Canonical per-object constraint sets
//!
//! A [`DependencyList`] keeps, for every object, the smallest list of
//! constraints that describes the intersection of everything merged for it.
//! The stored list always has one of these shapes:
//!
//! | Shape | Stored constraints |
//! |-------|--------------------|
//! | Point | `= v` |
//! | NoBound | `!=` holes only (possibly none) |
//! | LowerOnly | `>`/`>=` plus holes |
//! | UpperOnly | `<`/`<=` plus holes |
//! | Bounded | lower, upper plus holes |
//!
//! Holes always lie strictly inside the open range. A hole that would sit on
//! a closed boundary opens that boundary instead.

use crate::constraint::relation::{Relation, VersionConstraint};
use crate::constraint::version::Version;
use crate::error::{BuildEnvError, BuildEnvResult};
use crate::package::PackageKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// One end of a range
#[derive(Debug, Clone, PartialEq, Eq)]
struct Bound {
    version: Version,
    inclusive: bool,
}

impl Bound {
    fn from_constraint(constraint: &VersionConstraint) -> Option<Self> {
        constraint.version().map(|version| Self {
            version: version.clone(),
            inclusive: constraint.relation().is_inclusive(),
        })
    }

    fn as_lower(&self) -> VersionConstraint {
        let relation = if self.inclusive { Relation::Ge } else { Relation::Gt };
        VersionConstraint::new(relation, self.version.clone())
    }

    fn as_upper(&self) -> VersionConstraint {
        let relation = if self.inclusive { Relation::Le } else { Relation::Lt };
        VersionConstraint::new(relation, self.version.clone())
    }

    /// Pick the more restrictive of two lower bounds
    fn tighter_lower(self, other: Bound) -> Bound {
        match self.version.cmp(&other.version) {
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Equal => Bound {
                inclusive: self.inclusive && other.inclusive,
                ..self
            },
        }
    }

    /// Pick the more restrictive of two upper bounds
    fn tighter_upper(self, other: Bound) -> Bound {
        match self.version.cmp(&other.version) {
            std::cmp::Ordering::Less => self,
            std::cmp::Ordering::Greater => other,
            std::cmp::Ordering::Equal => Bound {
                inclusive: self.inclusive && other.inclusive,
                ..self
            },
        }
    }
}

/// Canonical state of one object's constraints
#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Point(Version),
    NoBound {
        holes: BTreeSet<Version>,
    },
    LowerOnly {
        lower: Bound,
        holes: BTreeSet<Version>,
    },
    UpperOnly {
        upper: Bound,
        holes: BTreeSet<Version>,
    },
    Bounded {
        lower: Bound,
        upper: Bound,
        holes: BTreeSet<Version>,
    },
}

/// The merge produced an empty set
struct Empty;

impl Shape {
    /// Classify a stored canonical list
    fn classify(constraints: &[VersionConstraint]) -> Self {
        let mut lower = None;
        let mut upper = None;
        let mut holes = BTreeSet::new();

        for constraint in constraints {
            let Some(version) = constraint.version() else {
                continue;
            };
            match constraint.relation() {
                Relation::Eq => return Self::Point(version.clone()),
                Relation::Ne => {
                    holes.insert(version.clone());
                }
                Relation::Gt | Relation::Ge => lower = Bound::from_constraint(constraint),
                Relation::Lt | Relation::Le => upper = Bound::from_constraint(constraint),
                Relation::None => {}
            }
        }

        Self::from_parts(lower, upper, holes)
    }

    fn from_parts(lower: Option<Bound>, upper: Option<Bound>, holes: BTreeSet<Version>) -> Self {
        match (lower, upper) {
            (None, None) => Self::NoBound { holes },
            (Some(lower), None) => Self::LowerOnly { lower, holes },
            (None, Some(upper)) => Self::UpperOnly { upper, holes },
            (Some(lower), Some(upper)) => Self::Bounded {
                lower,
                upper,
                holes,
            },
        }
    }

    fn into_parts(self) -> (Option<Bound>, Option<Bound>, BTreeSet<Version>) {
        match self {
            Self::Point(version) => {
                let bound = Bound {
                    version,
                    inclusive: true,
                };
                (Some(bound.clone()), Some(bound), BTreeSet::new())
            }
            Self::NoBound { holes } => (None, None, holes),
            Self::LowerOnly { lower, holes } => (Some(lower), None, holes),
            Self::UpperOnly { upper, holes } => (None, Some(upper), holes),
            Self::Bounded {
                lower,
                upper,
                holes,
            } => (Some(lower), Some(upper), holes),
        }
    }

    fn admits(&self, version: &Version) -> bool {
        self.to_constraints().iter().all(|c| c.fulfilled(version))
    }

    /// Apply one incoming constraint
    fn merge(self, incoming: &VersionConstraint) -> Result<Self, Empty> {
        let relation = incoming.relation();
        let Some(version) = incoming.version().cloned() else {
            return Ok(self);
        };
        let bound = Bound {
            version: version.clone(),
            inclusive: relation.is_inclusive(),
        };

        match (self, relation) {
            (shape, Relation::None) => Ok(shape),

            // A point can only survive or vanish
            (Self::Point(point), _) => {
                if incoming.fulfilled(&point) {
                    Ok(Self::Point(point))
                } else {
                    Err(Empty)
                }
            }

            // Pinning a range
            (shape, Relation::Eq) => {
                if shape.admits(&version) {
                    Ok(Self::Point(version))
                } else {
                    Err(Empty)
                }
            }

            // Punching a hole
            (Self::NoBound { mut holes }, Relation::Ne) => {
                holes.insert(version);
                Ok(Self::NoBound { holes })
            }
            (Self::LowerOnly { lower, mut holes }, Relation::Ne) => {
                holes.insert(version);
                normalize(Some(lower), None, holes)
            }
            (Self::UpperOnly { upper, mut holes }, Relation::Ne) => {
                holes.insert(version);
                normalize(None, Some(upper), holes)
            }
            (
                Self::Bounded {
                    lower,
                    upper,
                    mut holes,
                },
                Relation::Ne,
            ) => {
                holes.insert(version);
                normalize(Some(lower), Some(upper), holes)
            }

            // Raising the floor
            (Self::NoBound { holes }, Relation::Gt | Relation::Ge) => {
                normalize(Some(bound), None, holes)
            }
            (Self::LowerOnly { lower, holes }, Relation::Gt | Relation::Ge) => {
                normalize(Some(lower.tighter_lower(bound)), None, holes)
            }
            (Self::UpperOnly { upper, holes }, Relation::Gt | Relation::Ge) => {
                normalize(Some(bound), Some(upper), holes)
            }
            (
                Self::Bounded {
                    lower,
                    upper,
                    holes,
                },
                Relation::Gt | Relation::Ge,
            ) => normalize(Some(lower.tighter_lower(bound)), Some(upper), holes),

            // Lowering the ceiling
            (Self::NoBound { holes }, Relation::Lt | Relation::Le) => {
                normalize(None, Some(bound), holes)
            }
            (Self::LowerOnly { lower, holes }, Relation::Lt | Relation::Le) => {
                normalize(Some(lower), Some(bound), holes)
            }
            (Self::UpperOnly { upper, holes }, Relation::Lt | Relation::Le) => {
                normalize(None, Some(upper.tighter_upper(bound)), holes)
            }
            (
                Self::Bounded {
                    lower,
                    upper,
                    holes,
                },
                Relation::Lt | Relation::Le,
            ) => normalize(Some(lower), Some(upper.tighter_upper(bound)), holes),
        }
    }

    fn to_constraints(&self) -> Vec<VersionConstraint> {
        if let Self::Point(version) = self {
            return vec![VersionConstraint::new(Relation::Eq, version.clone())];
        }

        let (lower, upper, holes) = self.clone().into_parts();
        let mut out = Vec::with_capacity(2 + holes.len());
        if let Some(lower) = lower {
            out.push(lower.as_lower());
        }
        if let Some(upper) = upper {
            out.push(upper.as_upper());
        }
        out.extend(holes.into_iter().map(|v| VersionConstraint::new(Relation::Ne, v)));
        out
    }
}

/// Bring bounds and holes into canonical form
fn normalize(
    mut lower: Option<Bound>,
    mut upper: Option<Bound>,
    holes: BTreeSet<Version>,
) -> Result<Shape, Empty> {
    let mut kept = BTreeSet::new();
    for hole in holes {
        if let Some(bound) = lower.as_mut() {
            if hole < bound.version {
                continue;
            }
            if hole == bound.version {
                bound.inclusive = false;
                continue;
            }
        }
        if let Some(bound) = upper.as_mut() {
            if hole > bound.version {
                continue;
            }
            if hole == bound.version {
                bound.inclusive = false;
                continue;
            }
        }
        kept.insert(hole);
    }

    if let (Some(low), Some(high)) = (&lower, &upper) {
        match low.version.cmp(&high.version) {
            std::cmp::Ordering::Greater => return Err(Empty),
            std::cmp::Ordering::Equal if low.inclusive && high.inclusive => {
                return Ok(Shape::Point(low.version.clone()));
            }
            std::cmp::Ordering::Equal => return Err(Empty),
            std::cmp::Ordering::Less => {}
        }
    }

    Ok(Shape::from_parts(lower, upper, kept))
}

/// Per-object canonical constraint sets
///
/// Objects default to [`PackageKey`]; any ordered key works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[serde(bound(
    serialize = "K: Serialize + Ord",
    deserialize = "K: Deserialize<'de> + Ord"
))]
pub struct DependencyList<K = PackageKey> {
    entries: BTreeMap<K, Vec<VersionConstraint>>,
}

impl<K> Default for DependencyList<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone + fmt::Display> DependencyList<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrow `object`'s constraints by `constraint`
    ///
    /// Fails with [`BuildEnvError::ConstraintContradiction`] when no version
    /// could satisfy the result; the stored list is then left untouched.
    pub fn add_constraint(
        &mut self,
        object: K,
        constraint: VersionConstraint,
    ) -> BuildEnvResult<()> {
        let merged = self.merged_with(&object, &constraint)?;
        self.entries.insert(object, merged);
        Ok(())
    }

    fn merged_with(
        &self,
        object: &K,
        constraint: &VersionConstraint,
    ) -> BuildEnvResult<Vec<VersionConstraint>> {
        let current = self.entries.get(object).map(Vec::as_slice).unwrap_or(&[]);

        if let Some(conflict) = current.iter().find(|c| !c.is_compatible(constraint)) {
            return Err(BuildEnvError::ConstraintContradiction {
                object: object.to_string(),
                existing: conflict.to_string(),
                incoming: constraint.to_string(),
            });
        }

        Shape::classify(current)
            .merge(constraint)
            .map(|shape| shape.to_constraints())
            .map_err(|Empty| BuildEnvError::ConstraintContradiction {
                object: object.to_string(),
                existing: render(current),
                incoming: constraint.to_string(),
            })
    }

    /// Merge every constraint of `other`, all or nothing
    pub fn merge(&mut self, other: &DependencyList<K>) -> BuildEnvResult<()> {
        let mut staged = self.clone();
        for (object, constraints) in &other.entries {
            if constraints.is_empty() {
                staged.add_constraint(object.clone(), VersionConstraint::none())?;
            }
            for constraint in constraints {
                staged.add_constraint(object.clone(), constraint.clone())?;
            }
        }
        *self = staged;
        Ok(())
    }

    /// Objects that carry at least a `none` constraint
    pub fn get_required(&self) -> BTreeSet<K> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_required(&self, object: &K) -> bool {
        self.entries.contains_key(object)
    }

    /// Canonical constraint list of `object` (empty when unconstrained)
    pub fn constraints(&self, object: &K) -> &[VersionConstraint] {
        self.entries.get(object).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `version` of `object` satisfies everything stored
    ///
    /// Objects that were never constrained contain every version.
    pub fn contains(&self, object: &K, version: &Version) -> bool {
        self.constraints(object).iter().all(|c| c.fulfilled(version))
    }

    /// Forget everything about `object`
    pub fn remove(&mut self, object: &K) -> bool {
        self.entries.remove(object).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &[VersionConstraint])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }
}

fn render(constraints: &[VersionConstraint]) -> String {
    if constraints.is_empty() {
        return "none".to_string();
    }
    constraints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl<K: Ord + Clone + fmt::Display> fmt::Display for DependencyList<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (object, constraints) in &self.entries {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            if constraints.is_empty() {
                write!(f, "{}", object)?;
            } else {
                write!(f, "{} {}", object, render(constraints))?;
            }
        }
        Ok(())
    }
}

impl DependencyList<PackageKey> {
    /// Merge every `name:arch [op version, ...]` requirement into one list
    pub fn from_requirements<'a>(
        requirements: impl IntoIterator<Item = &'a str>,
    ) -> BuildEnvResult<Self> {
        let mut list = Self::new();
        for entry in requirements {
            let (object, constraints) = parse_requirement(entry)?;
            if constraints.is_empty() {
                list.add_constraint(object.clone(), VersionConstraint::none())?;
            }
            for constraint in constraints {
                list.add_constraint(object.clone(), constraint)?;
            }
        }
        Ok(list)
    }
}

impl FromStr for DependencyList<PackageKey> {
    type Err = BuildEnvError;

    /// Parse `name:arch >= 1.0, < 2.0; other:arch`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_requirements(s.split(';').map(str::trim).filter(|e| !e.is_empty()))
    }
}

/// Parse one `name:arch [op version[, op version...]]` requirement
pub fn parse_requirement(entry: &str) -> BuildEnvResult<(PackageKey, Vec<VersionConstraint>)> {
    let entry = entry.trim();
    let split = entry
        .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '=' | '!'))
        .unwrap_or(entry.len());
    let (object, rest) = entry.split_at(split);
    let object: PackageKey = object.parse()?;

    let constraints = rest
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(VersionConstraint::from_str)
        .collect::<BuildEnvResult<Vec<_>>>()?;

    Ok((object, constraints))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        s.parse().unwrap()
    }

    fn key() -> PackageKey {
        PackageKey::new("gcc", "amd64")
    }

    fn list_of(constraints: &[&str]) -> DependencyList {
        let mut list = DependencyList::new();
        for constraint in constraints {
            list.add_constraint(key(), c(constraint)).unwrap();
        }
        list
    }

    fn rendered(list: &DependencyList) -> Vec<String> {
        list.constraints(&key()).iter().map(ToString::to_string).collect()
    }

    #[test]
    fn interval_collapses_to_point() {
        let list = list_of(&[">=2", "<4", "<=2"]);
        assert_eq!(rendered(&list), vec!["= 2"]);
    }

    #[test]
    fn contradiction_leaves_list_unchanged() {
        let mut list = list_of(&[">=2"]);
        let before = list.clone();

        let err = list.add_constraint(key(), c("<2")).unwrap_err();
        assert!(matches!(err, BuildEnvError::ConstraintContradiction { .. }));
        assert_eq!(list, before);
    }

    #[test]
    fn tighter_bounds_replace_looser() {
        let list = list_of(&[">=1", ">=2", "<9", "<5"]);
        assert_eq!(rendered(&list), vec![">= 2", "< 5"]);

        let list = list_of(&[">=2", ">2"]);
        assert_eq!(rendered(&list), vec!["> 2"]);

        let list = list_of(&["<=5", "<5"]);
        assert_eq!(rendered(&list), vec!["< 5"]);
    }

    #[test]
    fn exclusion_on_closed_boundary_opens_it() {
        let list = list_of(&[">=2", "<=5", "!=2"]);
        assert_eq!(rendered(&list), vec!["> 2", "<= 5"]);

        let list = list_of(&[">=2", "<=5", "!=5"]);
        assert_eq!(rendered(&list), vec![">= 2", "< 5"]);
    }

    #[test]
    fn exclusion_outside_range_is_dropped() {
        let list = list_of(&[">=2", "!=1"]);
        assert_eq!(rendered(&list), vec![">= 2"]);

        let list = list_of(&["<2", "!=2"]);
        assert_eq!(rendered(&list), vec!["< 2"]);
    }

    #[test]
    fn holes_inside_range_are_kept_sorted() {
        let list = list_of(&["!=3", ">=1", "!=2", "<5"]);
        assert_eq!(rendered(&list), vec![">= 1", "< 5", "!= 2", "!= 3"]);
    }

    #[test]
    fn new_bound_absorbs_existing_holes() {
        let list = list_of(&["!=3", "!=7", "<=3"]);
        assert_eq!(rendered(&list), vec!["< 3"]);
    }

    #[test]
    fn point_absorbs_compatible_constraints() {
        let list = list_of(&["=2", ">=1", "!=3", "<5"]);
        assert_eq!(rendered(&list), vec!["= 2"]);

        let mut list = list_of(&["=2"]);
        assert!(list.add_constraint(key(), c("!=2")).is_err());
        assert!(list.add_constraint(key(), c(">2")).is_err());
        assert_eq!(rendered(&list), vec!["= 2"]);
    }

    #[test]
    fn pin_inside_range_becomes_point() {
        let list = list_of(&[">=1", "<5", "!=3", "=4"]);
        assert_eq!(rendered(&list), vec!["= 4"]);

        let mut list = list_of(&[">=1", "<5", "!=3"]);
        assert!(list.add_constraint(key(), c("=3")).is_err());
    }

    #[test]
    fn closing_on_hole_is_a_contradiction() {
        let mut list = list_of(&["!=2", "<=2"]);
        assert_eq!(rendered(&list), vec!["< 2"]);
        assert!(list.add_constraint(key(), c(">=2")).is_err());
    }

    #[test]
    fn none_registers_object() {
        let list = list_of(&["none"]);
        assert!(list.is_required(&key()));
        assert!(list.constraints(&key()).is_empty());
        assert!(list.contains(&key(), &v("0.1")));
    }

    #[test]
    fn unconstrained_objects_contain_everything() {
        let list = DependencyList::new();
        assert!(list.contains(&PackageKey::new("make", "amd64"), &v("1.0")));
        assert!(list.get_required().is_empty());
    }

    #[test]
    fn contains_equals_conjunction_of_inputs() {
        let sequences: &[&[&str]] = &[
            &[">=1", "<5", "!=3"],
            &["!=2", ">=2", "<=4", "!=4"],
            &["<=3", ">1", "!=1.5", "!=7"],
            &[">1", ">=2", "<10", "<=9", "!=9"],
            &["=3", "<=3", ">=3"],
        ];
        let probes = ["0", "1", "1.5", "2", "2.5", "3", "3.5", "4", "5", "7", "9", "10"];

        for sequence in sequences {
            let list = list_of(sequence);
            for probe in probes {
                let version = v(probe);
                let expected = sequence.iter().all(|s| c(s).fulfilled(&version));
                assert_eq!(
                    list.contains(&key(), &version),
                    expected,
                    "sequence {:?} probe {}",
                    sequence,
                    probe
                );
            }
        }
    }

    #[test]
    fn narrowing_is_monotonic() {
        let steps = [">=1", "<9", "!=4", ">2", "<=8", "!=8"];
        let probes = ["0", "1", "2", "3", "4", "5", "8", "9"];
        let mut list = DependencyList::new();
        let mut previous: Vec<bool> = probes.iter().map(|_| true).collect();

        for step in steps {
            list.add_constraint(key(), c(step)).unwrap();
            let now: Vec<bool> = probes.iter().map(|p| list.contains(&key(), &v(p))).collect();
            for (before, after) in previous.iter().zip(&now) {
                assert!(*before || !*after, "{} widened the set", step);
            }
            previous = now;
        }
    }

    #[test]
    fn list_length_stays_small() {
        let list = list_of(&[">=1", ">=2", ">=3", "<9", "<8", "<7"]);
        assert_eq!(list.constraints(&key()).len(), 2);
    }

    #[test]
    fn merge_is_all_or_nothing() {
        let mut base: DependencyList = "gcc:amd64 >= 2; make:amd64".parse().unwrap();
        let bad: DependencyList = "make:amd64 = 4; gcc:amd64 < 2".parse().unwrap();
        let before = base.clone();

        assert!(base.merge(&bad).is_err());
        assert_eq!(base, before);

        let good: DependencyList = "gcc:amd64 < 3; bison:amd64".parse().unwrap();
        base.merge(&good).unwrap();
        assert_eq!(base.len(), 3);
        assert_eq!(base.to_string(), "bison:amd64; gcc:amd64 >= 2, < 3; make:amd64");
    }

    #[test]
    fn parse_requirement_syntax() {
        let (object, constraints) = parse_requirement("libc6:amd64>=2.36, <3").unwrap();
        assert_eq!(object, PackageKey::new("libc6", "amd64"));
        assert_eq!(constraints.len(), 2);

        let (_, constraints) = parse_requirement("libc6:amd64").unwrap();
        assert!(constraints.is_empty());

        assert!(parse_requirement("libc6 >= 2").is_err());
        assert!(parse_requirement("libc6:amd64 => 2").is_err());
    }

    #[test]
    fn from_requirements_merges_repeated_objects() {
        let list =
            DependencyList::from_requirements(["gcc:amd64 >= 11", "gcc:amd64 < 13", "make:all"])
                .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.constraints(&PackageKey::new("gcc", "amd64")).len(), 2);
        assert!(list.is_required(&PackageKey::new("make", "all")));

        let err = DependencyList::from_requirements(["gcc:amd64 >= 13", "gcc:amd64 < 12"])
            .unwrap_err();
        assert!(matches!(err, BuildEnvError::ConstraintContradiction { .. }));
    }

    #[test]
    fn serde_roundtrip_as_map() {
        let list: DependencyList = "gcc:amd64 >= 12, != 12.1".parse().unwrap();
        let json = serde_json::to_string(&list).unwrap();
        assert!(json.contains("\"gcc:amd64\""));
        let back: DependencyList = serde_json::from_str(&json).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn remove_forgets_object() {
        let mut list = list_of(&[">=2"]);
        assert!(list.remove(&key()));
        assert!(!list.remove(&key()));
        assert!(list.is_empty());
    }
}
