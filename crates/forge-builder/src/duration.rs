//! The build time-limit grammar.
//!
//! `<int><unit>(<int><unit>)*` with units `d`, `h`, `m`, `s` in
//! non-increasing size order. Terms are summed.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
  #[error("bad duration specifier: '{0}'")]
  BadSpecifier(String),

  #[error("bad duration specifier order")]
  BadOrder,
}

/// Parse a time limit such as `1d2h30m`.
pub fn parse_time_limit(input: &str) -> Result<Duration, DurationError> {
  if input.is_empty() {
    return Err(DurationError::BadSpecifier(input.to_string()));
  }

  let mut total = 0u64;
  let mut last_rank = 0u8;
  let mut chars = input.chars().peekable();

  while chars.peek().is_some() {
    let mut digits = String::new();
    while let Some(c) = chars.peek()
      && c.is_ascii_digit()
    {
      digits.push(*c);
      chars.next();
    }
    let Some(unit) = chars.next() else {
      // Trailing number with no unit.
      return Err(DurationError::BadSpecifier(digits));
    };
    let n: u64 = digits.parse().map_err(|_| DurationError::BadSpecifier(unit.to_string()))?;

    let (rank, seconds) = match unit {
      'd' => (1, 86_400),
      'h' => (2, 3_600),
      'm' => (3, 60),
      's' => (4, 1),
      other => return Err(DurationError::BadSpecifier(other.to_string())),
    };
    if rank < last_rank {
      return Err(DurationError::BadOrder);
    }
    last_rank = rank;
    total += n * seconds;
  }

  Ok(Duration::from_secs(total))
}
