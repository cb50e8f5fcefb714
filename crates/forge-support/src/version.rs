//! Package versions and version range predicates.
//!
//! A version is either a concrete release (`major.minor.patch[.tweak]`) or a
//! branch marker. Ranges are conjunctions of simple comparators and support
//! picking the maximum satisfying version out of a set.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
  #[error("empty version")]
  Empty,

  #[error("invalid version: '{0}'")]
  Invalid(String),

  #[error("invalid version range: '{0}'")]
  InvalidRange(String),
}

/// A concrete package version: a release tuple or a branch name.
///
/// The branch `*` is the wildcard version used by predefined packages that
/// exist in exactly one revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Version {
  Release { major: u64, minor: u64, patch: u64, tweak: u64 },
  Branch(String),
}

impl Version {
  pub fn release(major: u64, minor: u64, patch: u64) -> Self {
    Version::Release {
      major,
      minor,
      patch,
      tweak: 0,
    }
  }

  /// The wildcard version.
  pub fn any() -> Self {
    Version::Branch("*".to_string())
  }

  pub fn is_any(&self) -> bool {
    matches!(self, Version::Branch(b) if b == "*")
  }

  pub fn is_release(&self) -> bool {
    matches!(self, Version::Release { .. })
  }

  /// Canonical string, with `*` standing in for the wildcard.
  pub fn to_any_version(&self) -> String {
    if self.is_any() { "*".to_string() } else { self.to_string() }
  }

  fn release_tuple(&self) -> Option<(u64, u64, u64, u64)> {
    match self {
      Version::Release {
        major,
        minor,
        patch,
        tweak,
      } => Some((*major, *minor, *patch, *tweak)),
      Version::Branch(_) => None,
    }
  }
}

// Branches order below releases; among themselves both kinds order naturally.
impl Ord for Version {
  fn cmp(&self, other: &Self) -> Ordering {
    match (self, other) {
      (Version::Release { .. }, Version::Branch(_)) => Ordering::Greater,
      (Version::Branch(_), Version::Release { .. }) => Ordering::Less,
      (Version::Branch(a), Version::Branch(b)) => a.cmp(b),
      _ => self.release_tuple().cmp(&other.release_tuple()),
    }
  }
}

impl PartialOrd for Version {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Version::Release {
        major,
        minor,
        patch,
        tweak,
      } => {
        write!(f, "{major}.{minor}.{patch}")?;
        if *tweak > 0 {
          write!(f, ".{tweak}")?;
        }
        Ok(())
      }
      Version::Branch(b) => write!(f, "{b}"),
    }
  }
}

fn is_branch_name(s: &str) -> bool {
  let mut chars = s.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl FromStr for Version {
  type Err = VersionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.is_empty() {
      return Err(VersionError::Empty);
    }
    if s == "*" {
      return Ok(Version::any());
    }
    if s.starts_with(|c: char| c.is_ascii_digit()) {
      let parts: Vec<&str> = s.split('.').collect();
      if parts.len() > 4 {
        return Err(VersionError::Invalid(s.to_string()));
      }
      let mut nums = [0u64; 4];
      for (i, p) in parts.iter().enumerate() {
        nums[i] = p.parse().map_err(|_| VersionError::Invalid(s.to_string()))?;
      }
      return Ok(Version::Release {
        major: nums[0],
        minor: nums[1],
        patch: nums[2],
        tweak: nums[3],
      });
    }
    if is_branch_name(s) {
      return Ok(Version::Branch(s.to_string()));
    }
    Err(VersionError::Invalid(s.to_string()))
  }
}

impl TryFrom<String> for Version {
  type Error = VersionError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl From<Version> for String {
  fn from(v: Version) -> String {
    v.to_string()
  }
}

/// One term of a range conjunction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Comparator {
  Any,
  Exact(Version),
  Prefix { major: u64, minor: Option<u64> },
  Greater(Version),
  GreaterEq(Version),
  Less(Version),
  LessEq(Version),
}

impl Comparator {
  fn matches(&self, v: &Version) -> bool {
    match self {
      Comparator::Any => true,
      Comparator::Exact(e) => v == e,
      Comparator::Prefix { major, minor } => match v {
        Version::Release { major: vm, minor: vn, .. } => vm == major && minor.is_none_or(|m| *vn == m),
        Version::Branch(_) => false,
      },
      Comparator::Greater(b) => v.is_release() && v > b,
      Comparator::GreaterEq(b) => v.is_release() && v >= b,
      Comparator::Less(b) => v.is_release() && v < b,
      Comparator::LessEq(b) => v.is_release() && v <= b,
    }
  }
}

impl fmt::Display for Comparator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Comparator::Any => write!(f, "*"),
      Comparator::Exact(v) => write!(f, "{v}"),
      Comparator::Prefix { major, minor } => match minor {
        Some(m) => write!(f, "{major}.{m}.*"),
        None => write!(f, "{major}.*"),
      },
      Comparator::Greater(v) => write!(f, ">{v}"),
      Comparator::GreaterEq(v) => write!(f, ">={v}"),
      Comparator::Less(v) => write!(f, "<{v}"),
      Comparator::LessEq(v) => write!(f, "<={v}"),
    }
  }
}

/// A predicate over versions: the conjunction of its comparators.
///
/// Supported forms: `*`, exact versions (`1.2.3`, `=1.2.3`, branch names),
/// prefix wildcards (`1.*`, `1.2.*`) and comparator conjunctions
/// (`>=1.2 <2.0`). Surrounding brackets are tolerated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
  parts: Vec<Comparator>,
}

impl VersionRange {
  /// The range matching every version.
  pub fn any() -> Self {
    VersionRange {
      parts: vec![Comparator::Any],
    }
  }

  pub fn exact(v: Version) -> Self {
    VersionRange {
      parts: vec![Comparator::Exact(v)],
    }
  }

  pub fn contains(&self, v: &Version) -> bool {
    self.parts.iter().all(|p| p.matches(v))
  }

  /// The single version this range pins, if it is an exact range.
  pub fn as_exact(&self) -> Option<&Version> {
    match self.parts.as_slice() {
      [Comparator::Exact(v)] => Some(v),
      _ => None,
    }
  }

  /// Pick the greatest version out of `versions` satisfying the range.
  pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<Version>
  where
    I: IntoIterator<Item = &'a Version>,
  {
    versions.into_iter().filter(|v| self.contains(v)).max().cloned()
  }
}

impl fmt::Display for VersionRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
    write!(f, "{}", parts.join(" "))
  }
}

impl FromStr for VersionRange {
  type Err = VersionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if trimmed.is_empty() {
      return Err(VersionError::InvalidRange(s.to_string()));
    }
    let mut parts = Vec::new();
    for token in trimmed.split([' ', ',']).filter(|t| !t.is_empty()) {
      parts.push(parse_comparator(token).ok_or_else(|| VersionError::InvalidRange(s.to_string()))?);
    }
    Ok(VersionRange { parts })
  }
}

fn parse_comparator(token: &str) -> Option<Comparator> {
  if token == "*" {
    return Some(Comparator::Any);
  }
  for (prefix, make) in [
    (">=", Comparator::GreaterEq as fn(Version) -> Comparator),
    ("<=", Comparator::LessEq),
    (">", Comparator::Greater),
    ("<", Comparator::Less),
    ("=", Comparator::Exact),
  ] {
    if let Some(rest) = token.strip_prefix(prefix) {
      return rest.parse().ok().map(make);
    }
  }
  if let Some(rest) = token.strip_suffix(".*") {
    let nums: Vec<&str> = rest.split('.').collect();
    return match nums.as_slice() {
      [major] => Some(Comparator::Prefix {
        major: major.parse().ok()?,
        minor: None,
      }),
      [major, minor] => Some(Comparator::Prefix {
        major: major.parse().ok()?,
        minor: Some(minor.parse().ok()?),
      }),
      _ => None,
    };
  }
  token.parse().ok().map(Comparator::Exact)
}

impl TryFrom<String> for VersionRange {
  type Error = VersionError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl From<VersionRange> for String {
  fn from(r: VersionRange) -> String {
    r.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn v(s: &str) -> Version {
    s.parse().unwrap()
  }

  fn r(s: &str) -> VersionRange {
    s.parse().unwrap()
  }

  #[test]
  fn version_display() {
    assert_eq!(v("1.2.3").to_string(), "1.2.3");
    assert_eq!(v("1.2").to_string(), "1.2.0");
    assert_eq!(v("1.2.3.4").to_string(), "1.2.3.4");
    assert_eq!(v("master").to_string(), "master");
  }

  #[test]
  fn wildcard_version() {
    let any = v("*");
    assert!(any.is_any());
    assert_eq!(any.to_any_version(), "*");
    assert_eq!(v("1.0.0").to_any_version(), "1.0.0");
  }

  #[test]
  fn version_ordering() {
    assert!(v("1.2.3") < v("1.10.0"));
    assert!(v("1.2.3") < v("1.2.3.1"));
    assert!(v("master") < v("0.0.1"));
  }

  #[test]
  fn invalid_versions() {
    assert!("".parse::<Version>().is_err());
    assert!("1.2.3.4.5".parse::<Version>().is_err());
    assert!("1.x".parse::<Version>().is_err());
  }

  #[test]
  fn range_prefix_wildcard() {
    let range = r("[1.*]");
    assert!(range.contains(&v("1.0.0")));
    assert!(range.contains(&v("1.2.0")));
    assert!(!range.contains(&v("2.0.0")));
  }

  #[test]
  fn range_max_satisfying() {
    let versions = vec![v("1.0.0"), v("1.2.0"), v("2.0.0")];
    assert_eq!(r("1.*").max_satisfying(&versions), Some(v("1.2.0")));

    let versions = vec![v("1.0.0"), v("1.2.0"), v("1.2.5"), v("2.0.0")];
    assert_eq!(r("1.*").max_satisfying(&versions), Some(v("1.2.5")));

    assert_eq!(r("3.*").max_satisfying(&versions), None);
  }

  #[test]
  fn range_comparators() {
    let range = r(">=1.2 <2.0");
    assert!(!range.contains(&v("1.0.0")));
    assert!(range.contains(&v("1.2.0")));
    assert!(range.contains(&v("1.9.9")));
    assert!(!range.contains(&v("2.0.0")));
  }

  #[test]
  fn range_exact_and_branch() {
    assert_eq!(r("1.2.3").as_exact(), Some(&v("1.2.3")));
    assert!(r("=1.2.3").contains(&v("1.2.3")));
    assert!(r("master").contains(&v("master")));
    assert!(!r("master").contains(&v("1.0.0")));
    assert!(r("*").as_exact().is_none());
  }

  #[test]
  fn range_roundtrip() {
    for s in ["*", "1.*", "1.2.*", ">=1.2.0 <2.0.0", "master"] {
      let range = r(s);
      assert_eq!(range, r(&range.to_string()));
    }
  }
}
