//! Hash helpers used across the storage layout and the build driver.

use blake2::{Blake2b512, Digest};
use sha1::Sha1;
use sha2::Sha256;

/// Hex-encoded SHA-1 of a string. Package storage identities use this.
pub fn sha1_hex(data: &str) -> String {
  format!("{:x}", Sha1::digest(data.as_bytes()))
}

/// Hex-encoded Blake2b-512 of a string. Config hashes and build hashes use this.
pub fn blake2b512_hex(data: &str) -> String {
  format!("{:x}", Blake2b512::digest(data.as_bytes()))
}

/// Hex-encoded SHA-256 of raw bytes. Settings content hashing uses this.
pub fn sha256_hex(data: &[u8]) -> String {
  format!("{:x}", Sha256::digest(data))
}

/// Truncate a hex hash to its first `n` characters.
pub fn shorten(hash: &str, n: usize) -> String {
  hash.chars().take(n).collect()
}
