//! Version selectors used by subject-version lookups

use std::fmt;
use std::str::FromStr;

use crate::schema::Version;

/// Which version of a subject a caller means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpec {
    /// Highest live version
    Latest,
    /// An explicit version number
    Exact(Version),
}

impl VersionSpec {
    /// Parse a selector: `latest`, `-1`, or a positive version number.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("latest") || input == "-1" {
            return Ok(VersionSpec::Latest);
        }
        match input.parse::<u32>() {
            Ok(0) | Err(_) => Err(format!(
                "invalid version '{}': must be 'latest', -1 or a positive integer",
                input
            )),
            Ok(n) => Ok(VersionSpec::Exact(Version::new(n))),
        }
    }
}

impl FromStr for VersionSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Version> for VersionSpec {
    fn from(version: Version) -> Self {
        VersionSpec::Exact(version)
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Latest => f.write_str("latest"),
            VersionSpec::Exact(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!(VersionSpec::parse("3").unwrap(), VersionSpec::Exact(Version::new(3)));
        assert_eq!(VersionSpec::parse("latest").unwrap(), VersionSpec::Latest);
        assert_eq!(VersionSpec::parse("LATEST").unwrap(), VersionSpec::Latest);
        assert_eq!(VersionSpec::parse("-1").unwrap(), VersionSpec::Latest);
    }

    #[test]
    fn test_invalid_versions() {
        assert!(VersionSpec::parse("0").is_err());
        assert!(VersionSpec::parse("-2").is_err());
        assert!(VersionSpec::parse("v1").is_err());
    }
}
