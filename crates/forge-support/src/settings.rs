//! Target settings: the recursive configuration mapping.
//!
//! Settings discriminate variants of a target (host vs. target platform,
//! debug vs. release, shared vs. static). Keys map to scalar strings,
//! nested settings, or arrays. Serialization is canonical (sorted keys), so
//! the content hash is stable under key reordering and can be used as a
//! configuration identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::{sha256_hex, shorten};

/// Length of the short configuration hash used in directory names.
const CONFIG_HASH_LEN: usize = 8;

/// A single settings value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
  Value(String),
  Map(TargetSettings),
  Array(Vec<SettingValue>),
}

impl SettingValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      SettingValue::Value(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&TargetSettings> {
    match self {
      SettingValue::Map(m) => Some(m),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[SettingValue]> {
    match self {
      SettingValue::Array(a) => Some(a),
      _ => None,
    }
  }
}

impl From<&str> for SettingValue {
  fn from(s: &str) -> Self {
    SettingValue::Value(s.to_string())
  }
}

impl From<String> for SettingValue {
  fn from(s: String) -> Self {
    SettingValue::Value(s)
  }
}

impl From<TargetSettings> for SettingValue {
  fn from(m: TargetSettings) -> Self {
    SettingValue::Map(m)
  }
}

impl From<Vec<SettingValue>> for SettingValue {
  fn from(a: Vec<SettingValue>) -> Self {
    SettingValue::Array(a)
  }
}

/// A structured, recursively nested string mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSettings {
  entries: BTreeMap<String, SettingValue>,
}

impl TargetSettings {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn get(&self, key: &str) -> Option<&SettingValue> {
    self.entries.get(key)
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.get(key).and_then(SettingValue::as_str)
  }

  pub fn get_map(&self, key: &str) -> Option<&TargetSettings> {
    self.get(key).and_then(SettingValue::as_map)
  }

  /// True when `key` holds exactly the scalar `value`.
  pub fn str_is(&self, key: &str, value: &str) -> bool {
    self.get_str(key) == Some(value)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
    self.entries.insert(key.into(), value.into());
  }

  pub fn remove(&mut self, key: &str) -> Option<SettingValue> {
    self.entries.remove(key)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
    self.entries.iter()
  }

  /// Merge `other` into `self`. Nested maps merge recursively; everything
  /// else is overwritten by the right-hand side.
  pub fn merge(&mut self, other: &TargetSettings) {
    for (k, v) in &other.entries {
      match (self.entries.get_mut(k), v) {
        (Some(SettingValue::Map(dst)), SettingValue::Map(src)) => dst.merge(src),
        _ => {
          self.entries.insert(k.clone(), v.clone());
        }
      }
    }
  }

  /// True when every entry of `self` appears in `other` with a matching
  /// value (maps compare recursively). An empty settings object is a subset
  /// of everything.
  pub fn is_subset_of(&self, other: &TargetSettings) -> bool {
    self.entries.iter().all(|(k, v)| match (v, other.entries.get(k)) {
      (SettingValue::Map(sub), Some(SettingValue::Map(sup))) => sub.is_subset_of(sup),
      (v, Some(ov)) => v == ov,
      (_, None) => false,
    })
  }

  /// Canonical serialized form: JSON with sorted keys.
  pub fn to_canonical_string(&self) -> String {
    serde_json::to_string(self).expect("settings serialize to JSON")
  }

  /// Content hash of the canonical form.
  pub fn content_hash(&self) -> String {
    shorten(&sha256_hex(self.to_canonical_string().as_bytes()), CONFIG_HASH_LEN)
  }
}

impl fmt::Display for TargetSettings {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_canonical_string())
  }
}

impl FromIterator<(String, SettingValue)> for TargetSettings {
  fn from_iter<T: IntoIterator<Item = (String, SettingValue)>>(iter: T) -> Self {
    TargetSettings {
      entries: iter.into_iter().collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn settings(pairs: &[(&str, &str)]) -> TargetSettings {
    let mut s = TargetSettings::new();
    for (k, v) in pairs {
      s.set(*k, *v);
    }
    s
  }

  #[test]
  fn scalar_access() {
    let s = settings(&[("config", "release"), ("platform", "linux")]);
    assert_eq!(s.get_str("config"), Some("release"));
    assert!(s.str_is("platform", "linux"));
    assert!(!s.str_is("platform", "windows"));
    assert!(s.get("missing").is_none());
  }

  #[test]
  fn canonical_hash_is_order_independent() {
    let mut a = TargetSettings::new();
    a.set("config", "release");
    a.set("platform", "linux");

    let mut b = TargetSettings::new();
    b.set("platform", "linux");
    b.set("config", "release");

    assert_eq!(a.to_canonical_string(), b.to_canonical_string());
    assert_eq!(a.content_hash(), b.content_hash());
  }

  #[test]
  fn hash_differs_for_different_content() {
    let a = settings(&[("config", "release")]);
    let b = settings(&[("config", "debug")]);
    assert_ne!(a.content_hash(), b.content_hash());
  }

  #[test]
  fn merge_is_right_biased_and_recursive() {
    let mut base = TargetSettings::new();
    base.set("config", "debug");
    let mut native = TargetSettings::new();
    native.set("cc", "gcc");
    native.set("linker", "ld");
    base.set("native", native);

    let mut over = TargetSettings::new();
    over.set("config", "release");
    let mut native2 = TargetSettings::new();
    native2.set("cc", "clang");
    over.set("native", native2);

    base.merge(&over);
    assert!(base.str_is("config", "release"));
    let native = base.get_map("native").unwrap();
    assert!(native.str_is("cc", "clang"));
    assert!(native.str_is("linker", "ld"));
  }

  #[test]
  fn subset_matching() {
    let requested = settings(&[("config", "release")]);
    let variant = settings(&[("config", "release"), ("platform", "linux")]);
    assert!(requested.is_subset_of(&variant));
    assert!(!variant.is_subset_of(&requested));

    let empty = TargetSettings::new();
    assert!(empty.is_subset_of(&variant));

    let mismatch = settings(&[("config", "debug")]);
    assert!(!mismatch.is_subset_of(&variant));
  }

  #[test]
  fn nested_subset_matching() {
    let mut requested = TargetSettings::new();
    let mut inner = TargetSettings::new();
    inner.set("cc", "gcc");
    requested.set("native", inner);

    let mut variant = TargetSettings::new();
    let mut inner = TargetSettings::new();
    inner.set("cc", "gcc");
    inner.set("linker", "ld");
    variant.set("native", inner);
    variant.set("config", "release");

    assert!(requested.is_subset_of(&variant));
  }

  #[test]
  fn serde_roundtrip() {
    let mut s = settings(&[("config", "release")]);
    s.set(
      "flags",
      vec![SettingValue::from("-O2"), SettingValue::from("-g")],
    );
    let json = serde_json::to_string(&s).unwrap();
    let back: TargetSettings = serde_json::from_str(&json).unwrap();
    assert_eq!(s, back);
  }
}
