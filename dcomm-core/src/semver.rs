//! Semantic version strings as used in message-type URIs.
//!
//! Accepts `major(.minor(.patch(-prerelease)?(+build)?)?)?`. Partial versions
//! such as `1` or `1.0` are common in protocol identifiers, so minor and patch
//! are optional, but presence is monotonic: patch requires minor, and
//! prerelease/build require patch.
//!
//! Ordering follows SemVer 2.0 precedence with one extension: values that tie
//! on precedence but differ in build metadata still sort deterministically,
//! using the build string as a final tiebreak. [`Semver::cmp_precedence`] gives
//! the pure SemVer comparison that ignores build.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DcommError, DcommResult};

lazy_static! {
    static ref SEMVER_PAT: Regex = Regex::new(concat!(
        r"^(0|[1-9][0-9]*)",
        r"(?:\.(0|[1-9][0-9]*)",
        r"(?:\.(0|[1-9][0-9]*)",
        r"(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?",
        r"(?:\+([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?",
        r")?)?$"
    ))
    .expect("valid regex");
}

/// A parsed semantic version. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Semver {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    prerelease: Option<String>,
    build: Option<String>,
}

impl Semver {
    /// Parse a version string.
    pub fn parse(text: &str) -> DcommResult<Self> {
        let caps = SEMVER_PAT
            .captures(text)
            .ok_or_else(|| DcommError::Format(format!("\"{text}\" is not a valid semver")))?;

        let number = |idx: usize| -> DcommResult<Option<u64>> {
            caps.get(idx)
                .map(|m| {
                    m.as_str().parse::<u64>().map_err(|_| {
                        DcommError::Format(format!("component \"{}\" of \"{text}\" overflows", m.as_str()))
                    })
                })
                .transpose()
        };

        let major = number(1)?.unwrap_or_default();
        let minor = number(2)?;
        let patch = number(3)?;
        let prerelease = caps.get(4).map(|m| m.as_str().to_string());
        let build = caps.get(5).map(|m| m.as_str().to_string());

        for ids in [&prerelease, &build].into_iter().flatten() {
            if let Some(bad) = ids.split('.').find(|seg| has_leading_zero(seg)) {
                return Err(DcommError::Format(format!(
                    "segment \"{bad}\" of \"{text}\" has a leading zero"
                )));
            }
        }

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }

    /// Build a release version `major.minor.patch`.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor: Some(minor),
            patch: Some(patch),
            prerelease: None,
            build: None,
        }
    }

    /// Build the two-part form `major.minor` used by most protocol identifiers.
    pub fn major_minor(major: u64, minor: u64) -> Self {
        Self {
            major,
            minor: Some(minor),
            patch: None,
            prerelease: None,
            build: None,
        }
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> Option<u64> {
        self.minor
    }

    pub fn patch(&self) -> Option<u64> {
        self.patch
    }

    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_deref()
    }

    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    /// SemVer precedence, ignoring build metadata.
    pub fn cmp_precedence(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // A release sorts after any of its prereleases.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => cmp_identifiers(a, b),
            })
    }

    /// How safely a component built for `self` can process a message
    /// declared as `other`.
    ///
    /// Returns 0 when incompatible (different major, or major 0 with
    /// differing minor). Otherwise the magnitude counts how much of the
    /// version tuple matches: 1 when only major matches, 2 when minor also
    /// matches, 3 with patch, 4 with prerelease, 5 when identical including
    /// build. The sign is negative when `self` is older than `other`.
    ///
    /// Missing components count as equal, so `1.0` against itself scores 5,
    /// not 2. Peers that score partial versions by the number of components
    /// present will rank candidates differently; both sides of a deployment
    /// need to agree on this ladder.
    pub fn compatible_with(&self, other: &Self) -> i8 {
        if self.major != other.major {
            return 0;
        }
        if self.major == 0 && self.minor != other.minor {
            return 0;
        }
        let magnitude = if self.minor != other.minor {
            1
        } else if self.patch != other.patch {
            2
        } else if self.prerelease != other.prerelease {
            3
        } else if self.build != other.build {
            4
        } else {
            5
        };
        if self.cmp(other) == Ordering::Less {
            -magnitude
        } else {
            magnitude
        }
    }
}

fn has_leading_zero(segment: &str) -> bool {
    segment.len() > 1 && segment.starts_with('0') && segment.bytes().all(|b| b.is_ascii_digit())
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Dot-separated identifier comparison: numeric segments compare by value and
/// sort before alphanumeric ones, alphanumeric segments compare in ASCII order,
/// and a shorter list that is a prefix of a longer one sorts first.
fn cmp_identifiers(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (is_numeric(x), is_numeric(y)) {
                    // No leading zeros, so length orders numbers of any size.
                    (true, true) => x.len().cmp(&y.len()).then_with(|| x.cmp(y)),
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl Ord for Semver {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_precedence(other)
            .then_with(|| match (&self.build, &other.build) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => cmp_identifiers(a, b),
            })
    }
}

impl PartialOrd for Semver {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{patch}")?;
        }
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for Semver {
    type Err = DcommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Semver {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Semver {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
