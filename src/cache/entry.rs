//! The timestamped, TTL-bounded wrapper stored at both cache tiers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached payload together with when it was cached and how long it stays valid.
///
/// Entries are never mutated: a second `set` for the same key replaces the
/// entry outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  /// The cached payload
  pub data: T,
  /// When the entry was created
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  /// Validity window measured from `timestamp`
  #[serde(rename = "ttl_ms", with = "ttl_millis")]
  pub ttl: Duration,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, timestamp: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      data,
      timestamp,
      ttl,
    }
  }

  /// An entry is valid while strictly less than `ttl` has elapsed.
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    now - self.timestamp < self.ttl
  }

  /// When the entry stops being valid.
  pub fn expires_at(&self) -> DateTime<Utc> {
    self.timestamp + self.ttl
  }
}

mod ttl_millis {
  use chrono::Duration;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(ttl.num_milliseconds())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let millis = i64::deserialize(deserializer)?;
    Ok(Duration::milliseconds(millis))
  }
}
