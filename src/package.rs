//! Package identities stored in image catalogs

use crate::constraint::Version;
use crate::error::{BuildEnvError, BuildEnvResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A package name on a specific architecture
///
/// Rendered and parsed as `name:arch`; serialised as that string so it can
/// be used as a JSON map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageKey {
    pub name: String,
    pub arch: String,
}

impl PackageKey {
    pub fn new(name: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arch: arch.into(),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.arch)
    }
}

impl FromStr for PackageKey {
    type Err = BuildEnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BuildEnvError::InvalidRequirement {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (name, arch) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected name:arch"))?;
        if name.is_empty() || arch.is_empty() {
            return Err(invalid("empty package name or architecture"));
        }
        if name.contains(char::is_whitespace) || arch.contains(char::is_whitespace) {
            return Err(invalid("whitespace in package name"));
        }
        Ok(Self::new(name, arch))
    }
}

impl TryFrom<String> for PackageKey {
    type Error = BuildEnvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PackageKey> for String {
    fn from(value: PackageKey) -> Self {
        value.to_string()
    }
}

/// An installed package: name, architecture and version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub arch: String,
    pub version: Version,
}

impl Package {
    pub fn new(name: impl Into<String>, arch: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            arch: arch.into(),
            version,
        }
    }

    /// Parse `name:arch=version`
    pub fn parse(input: &str) -> BuildEnvResult<Self> {
        let (key, version) =
            input
                .split_once('=')
                .ok_or_else(|| BuildEnvError::InvalidRequirement {
                    input: input.to_string(),
                    reason: "expected name:arch=version".to_string(),
                })?;
        let key: PackageKey = key.parse()?;
        Ok(Self::new(key.name, key.arch, Version::parse(version)?))
    }

    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.name, &self.arch)
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.name, self.arch, self.version)
    }
}

/// Catalog query filter; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    pub name: Option<String>,
    pub arch: Option<String>,
}

impl PackageFilter {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            arch: None,
        }
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn matches(&self, package: &Package) -> bool {
        self.name.as_deref().is_none_or(|name| name == package.name)
            && self.arch.as_deref().is_none_or(|arch| arch == package.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_and_display() {
        let key: PackageKey = "libc6:amd64".parse().unwrap();
        assert_eq!(key, PackageKey::new("libc6", "amd64"));
        assert_eq!(key.to_string(), "libc6:amd64");
        assert!("libc6".parse::<PackageKey>().is_err());
        assert!(":amd64".parse::<PackageKey>().is_err());
    }

    #[test]
    fn package_parse() {
        let pkg = Package::parse("gcc:amd64=4:12.2.0-3").unwrap();
        assert_eq!(pkg.name, "gcc");
        assert_eq!(pkg.version.epoch(), 4);
        assert_eq!(pkg.to_string(), "gcc:amd64=4:12.2.0-3");
        assert!(Package::parse("gcc:amd64").is_err());
    }

    #[test]
    fn filter_matches() {
        let pkg = Package::parse("make:arm64=4.3-4").unwrap();
        assert!(PackageFilter::default().matches(&pkg));
        assert!(PackageFilter::name("make").matches(&pkg));
        assert!(!PackageFilter::name("make").with_arch("amd64").matches(&pkg));
        assert!(!PackageFilter::name("gcc").matches(&pkg));
    }
}
