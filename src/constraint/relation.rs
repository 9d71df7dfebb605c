//! Single relational version tests

use crate::constraint::version::Version;
use crate::error::{BuildEnvError, BuildEnvResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Relation kinds a constraint can express
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// No restriction
    None,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relation {
    /// Parse an operator token
    pub fn from_token(token: &str) -> BuildEnvResult<Self> {
        match token {
            "" | "none" => Ok(Self::None),
            "=" | "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            other => Err(BuildEnvError::InvalidConstraintType(other.to_string())),
        }
    }

    /// Operator token used when rendering
    pub fn token(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Lower bound (`>`, `>=`)
    pub fn is_lower(&self) -> bool {
        matches!(self, Self::Gt | Self::Ge)
    }

    /// Upper bound (`<`, `<=`)
    pub fn is_upper(&self) -> bool {
        matches!(self, Self::Lt | Self::Le)
    }

    /// Whether the bound includes its own version
    pub fn is_inclusive(&self) -> bool {
        matches!(self, Self::Le | Self::Ge | Self::Eq)
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// One relational test against a version
///
/// A `none` constraint carries no version and accepts everything.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionConstraint {
    relation: Relation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<Version>,
}

impl VersionConstraint {
    /// Build a constraint; `Relation::None` discards the version
    pub fn new(relation: Relation, version: Version) -> Self {
        match relation {
            Relation::None => Self::none(),
            _ => Self {
                relation,
                version: Some(version),
            },
        }
    }

    /// The unrestricted constraint
    pub fn none() -> Self {
        Self {
            relation: Relation::None,
            version: None,
        }
    }

    pub fn relation(&self) -> Relation {
        self.relation
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Whether `version` passes this test
    pub fn fulfilled(&self, version: &Version) -> bool {
        let Some(own) = &self.version else {
            return true;
        };
        match self.relation {
            Relation::None => true,
            Relation::Eq => version == own,
            Relation::Ne => version != own,
            Relation::Lt => version < own,
            Relation::Le => version <= own,
            Relation::Gt => version > own,
            Relation::Ge => version >= own,
        }
    }

    /// Whether some version could satisfy both constraints at once
    pub fn is_compatible(&self, other: &VersionConstraint) -> bool {
        use Relation::*;

        let (a, b) = match (&self.version, &other.version) {
            (Some(a), Some(b)) => (a, b),
            // `none` on either side
            _ => return true,
        };

        match (self.relation, other.relation) {
            (None, _) | (_, None) => true,

            (Eq, _) => other.fulfilled(a),
            (_, Eq) => self.fulfilled(b),

            // An exclusion removes a single point; every other shape here is a ray
            (Ne, _) | (_, Ne) => true,

            (Lt | Le, Lt | Le) | (Gt | Ge, Gt | Ge) => true,

            (Ge, Le) => a <= b,
            (Le, Ge) => b <= a,
            (Gt | Ge, Lt | Le) => a < b,
            (Lt | Le, Gt | Ge) => b < a,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} {}", self.relation, version),
            None => write!(f, "none"),
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = BuildEnvError;

    /// Parse `">= 1.2"`, `"=1.0-1"`, `"none"` or a bare version (meaning `=`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "none" {
            return Ok(Self::none());
        }

        let split = s
            .find(|c: char| !matches!(c, '<' | '>' | '=' | '!' | '~'))
            .unwrap_or(s.len());
        let (token, rest) = s.split_at(split);
        let rest = rest.trim();

        let relation = if token.is_empty() {
            Relation::Eq
        } else {
            Relation::from_token(token)?
        };
        if relation == Relation::None || rest.is_empty() {
            return Err(BuildEnvError::InvalidConstraintType(s.to_string()));
        }

        Ok(Self::new(relation, Version::parse(rest)?))
    }
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

    #[test]
    fn parse_and_display() {
        assert_eq!(c(">=1.2").to_string(), ">= 1.2");
        assert_eq!(c("!= 2.0-1").relation(), Relation::Ne);
        assert_eq!(c("1.0").relation(), Relation::Eq);
        assert_eq!(c("none"), VersionConstraint::none());
        assert_eq!(c(""), VersionConstraint::none());
    }

    #[test]
    fn parse_rejects_unknown_operator() {
        let err = "=> 1.0".parse::<VersionConstraint>().unwrap_err();
        assert!(matches!(err, BuildEnvError::InvalidConstraintType(_)));
        assert!("~= 1.0".parse::<VersionConstraint>().is_err());
        assert!(">=".parse::<VersionConstraint>().is_err());
        assert!(matches!(
            Relation::from_token("<>"),
            Err(BuildEnvError::InvalidConstraintType(_))
        ));
    }

    #[test]
    fn fulfilled_table() {
        let two = v("2");
        assert!(c("=2").fulfilled(&two));
        assert!(!c("!=2").fulfilled(&two));
        assert!(c("<3").fulfilled(&two));
        assert!(!c("<2").fulfilled(&two));
        assert!(c("<=2").fulfilled(&two));
        assert!(!c(">2").fulfilled(&two));
        assert!(c(">=2").fulfilled(&two));
        assert!(VersionConstraint::none().fulfilled(&two));
    }

    #[test]
    fn none_is_compatible_with_everything() {
        for other in ["=1", "!=1", "<1", "<=1", ">1", ">=1"] {
            assert!(VersionConstraint::none().is_compatible(&c(other)));
            assert!(c(other).is_compatible(&VersionConstraint::none()));
        }
    }

    #[test]
    fn point_compatibility() {
        assert!(c("=2").is_compatible(&c("=2")));
        assert!(!c("=2").is_compatible(&c("=3")));
        assert!(!c("=2").is_compatible(&c("!=2")));
        assert!(c("=2").is_compatible(&c("!=3")));
        assert!(c("<3").is_compatible(&c("=2")));
        assert!(!c("<2").is_compatible(&c("=2")));
        assert!(c(">=2").is_compatible(&c("=2")));
    }

    #[test]
    fn opposite_rays() {
        assert!(c(">=2").is_compatible(&c("<=2")));
        assert!(c("<=2").is_compatible(&c(">=2")));
        assert!(!c(">=2").is_compatible(&c("<2")));
        assert!(!c(">2").is_compatible(&c("<=2")));
        assert!(!c("<2").is_compatible(&c(">2")));
        assert!(c(">2").is_compatible(&c("<3")));
        assert!(!c(">=3").is_compatible(&c("<=2")));
    }

    #[test]
    fn same_direction_rays_and_exclusions() {
        assert!(c(">5").is_compatible(&c(">=1")));
        assert!(c("<5").is_compatible(&c("<=1")));
        assert!(c("!=5").is_compatible(&c("<1")));
        assert!(c("!=5").is_compatible(&c("!=5")));
    }
}
