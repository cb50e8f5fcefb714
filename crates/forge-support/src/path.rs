//! Hierarchical package paths.
//!
//! A package path is a dotted sequence of name tokens, e.g.
//! `org.forge.demo.zlib`. The first token decides whether the path is
//! absolute (rooted in one of the well-known namespaces) and whether it is
//! repo-relative (`loc`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespaces a path may be rooted in.
const ROOT_NAMESPACES: &[&str] = &["com", "org", "pub", "pvt", "loc"];

/// Errors produced when parsing a package path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
  #[error("empty package path")]
  Empty,

  #[error("invalid package path element: '{0}'")]
  InvalidElement(String),
}

/// A hierarchical package name. Ordering is lexicographic over elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackagePath {
  elements: Vec<String>,
}

impl PackagePath {
  /// Build a path from pre-validated elements.
  pub fn from_elements(elements: Vec<String>) -> Self {
    Self { elements }
  }

  pub fn elements(&self) -> &[String] {
    &self.elements
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }

  /// True when the path starts with a well-known root namespace.
  pub fn is_absolute(&self) -> bool {
    self
      .elements
      .first()
      .is_some_and(|e| ROOT_NAMESPACES.iter().any(|ns| e.eq_ignore_ascii_case(ns)))
  }

  pub fn is_relative(&self) -> bool {
    !self.is_absolute()
  }

  /// True for repo-relative paths (`loc.*`). These never go through the
  /// remote package database.
  pub fn is_location(&self) -> bool {
    self.elements.first().is_some_and(|e| e.eq_ignore_ascii_case("loc"))
  }

  /// Sub-path of elements `[start, end)`. `end` is clamped to the length;
  /// an inverted range yields the empty path.
  pub fn slice(&self, start: usize, end: usize) -> PackagePath {
    let end = end.min(self.elements.len());
    if start >= end {
      return PackagePath::default();
    }
    PackagePath {
      elements: self.elements[start..end].to_vec(),
    }
  }

  /// Sub-path from `start` to the end.
  pub fn slice_from(&self, start: usize) -> PackagePath {
    self.slice(start, self.elements.len())
  }
}

impl fmt::Display for PackagePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.elements.join("."))
  }
}

impl FromStr for PackagePath {
  type Err = PathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.is_empty() {
      return Err(PathError::Empty);
    }
    let mut elements = Vec::new();
    for e in s.split('.') {
      if e.is_empty() || !e.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PathError::InvalidElement(e.to_string()));
      }
      elements.push(e.to_string());
    }
    Ok(PackagePath { elements })
  }
}

impl TryFrom<String> for PackagePath {
  type Error = PathError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl From<PackagePath> for String {
  fn from(p: PackagePath) -> String {
    p.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_and_display_roundtrip() {
    let p: PackagePath = "org.forge.demo.zlib".parse().unwrap();
    assert_eq!(p.len(), 4);
    assert_eq!(p.to_string(), "org.forge.demo.zlib");
  }

  #[test]
  fn rejects_bad_paths() {
    assert_eq!("".parse::<PackagePath>(), Err(PathError::Empty));
    assert!(matches!("org..x".parse::<PackagePath>(), Err(PathError::InvalidElement(_))));
    assert!(matches!("org.a-b".parse::<PackagePath>(), Err(PathError::InvalidElement(_))));
  }

  #[test]
  fn absolute_and_location_predicates() {
    let abs: PackagePath = "org.forge.demo".parse().unwrap();
    assert!(abs.is_absolute());
    assert!(!abs.is_relative());
    assert!(!abs.is_location());

    let loc: PackagePath = "loc.build.mylib".parse().unwrap();
    assert!(loc.is_absolute());
    assert!(loc.is_location());

    let rel: PackagePath = "mylib".parse().unwrap();
    assert!(rel.is_relative());
  }

  #[test]
  fn slice_clamps() {
    let p: PackagePath = "org.forge.demo.zlib".parse().unwrap();
    assert_eq!(p.slice(0, 2).to_string(), "org.forge");
    assert_eq!(p.slice(2, 10).to_string(), "demo.zlib");
    assert!(p.slice(3, 2).is_empty());
  }

  #[test]
  fn ordering_is_lexicographic() {
    let a: PackagePath = "org.alpha".parse().unwrap();
    let b: PackagePath = "org.beta".parse().unwrap();
    let c: PackagePath = "org.alpha.sub".parse().unwrap();
    assert!(a < b);
    assert!(a < c);
    assert!(c < b);
  }
}
