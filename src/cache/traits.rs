//! Core types for the response cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identity of a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Revalidation tokens issued by the server for a stored body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
  /// Entity tag, stored verbatim (quotes and weak prefix included)
  pub etag: Option<String>,
  /// Last-Modified HTTP date, stored verbatim
  pub last_modified: Option<String>,
}

impl Validators {
  pub fn is_empty(&self) -> bool {
    self.etag.is_none() && self.last_modified.is_none()
  }

  /// Take any validator present in `newer`, keeping ours otherwise.
  pub fn merge(&mut self, newer: Validators) {
    if newer.etag.is_some() {
      self.etag = newer.etag;
    }
    if newer.last_modified.is_some() {
      self.last_modified = newer.last_modified;
    }
  }
}

/// A stored successful response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: CacheKey,
  /// Logical operation that produced the entry (e.g. "issues/get")
  pub operation: String,
  /// Canonical request path, used for prefix invalidation
  pub path: String,
  pub status: u16,
  /// Response headers replayed when the entry is served
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub validators: Validators,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn expires_at(&self) -> DateTime<Utc> {
    chrono::Duration::from_std(self.ttl)
      .ok()
      .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at()
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }

  /// Size accounted against the store.
  pub fn size(&self) -> usize {
    self.body.len()
  }

  /// Restart the TTL, adopting any validators the server re-issued.
  pub fn refreshed(mut self, ttl: Duration, validators: Validators) -> Self {
    self.stored_at = Utc::now();
    self.ttl = ttl;
    self.validators.merge(validators);
    self
  }
}

/// Snapshot of cache accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub hit_count: u64,
  pub miss_count: u64,
  /// Live (unexpired) entries currently held
  pub total_entries: u64,
  pub total_bytes: u64,
}

impl CacheStats {
  pub fn lookups(&self) -> u64 {
    self.hit_count + self.miss_count
  }

  pub fn hit_ratio(&self) -> f64 {
    match self.lookups() {
      0 => 0.0,
      n => self.hit_count as f64 / n as f64,
    }
  }
}

/// How a response was produced, for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// No usable entry; full response from upstream
  Network,
  /// Entry existed but upstream sent a new representation
  Replaced,
  /// Upstream answered 304; body served from the entry
  Revalidated,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      CacheSource::Network => "network",
      CacheSource::Replaced => "replaced",
      CacheSource::Revalidated => "revalidated",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(ttl: Duration) -> CacheEntry {
    CacheEntry {
      key: CacheKey::new("k"),
      operation: "issues/get".into(),
      path: "/rest/api/3/issue/PROJ-1".into(),
      status: 200,
      headers: vec![],
      body: Bytes::from_static(b"{}"),
      validators: Validators {
        etag: Some("\"v1\"".into()),
        last_modified: None,
      },
      stored_at: Utc::now(),
      ttl,
    }
  }

  #[test]
  fn test_entry_expiry() {
    let e = entry(Duration::from_secs(60));
    assert!(!e.is_expired());
    assert!(e.is_expired_at(e.stored_at + chrono::Duration::seconds(60)));
    assert!(!e.is_expired_at(e.stored_at + chrono::Duration::seconds(59)));
  }

  #[test]
  fn test_refresh_keeps_validators_not_reissued() {
    let mut e = entry(Duration::from_secs(1));
    e.stored_at = Utc::now() - chrono::Duration::seconds(30);
    assert!(e.is_expired());

    let e = e.refreshed(
      Duration::from_secs(60),
      Validators {
        etag: None,
        last_modified: Some("Tue, 01 Oct 2024 10:00:00 GMT".into()),
      },
    );
    assert!(!e.is_expired());
    assert_eq!(e.validators.etag.as_deref(), Some("\"v1\""));
    assert!(e.validators.last_modified.is_some());
  }

  #[test]
  fn test_hit_ratio() {
    assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    let stats = CacheStats {
      hit_count: 3,
      miss_count: 1,
      ..Default::default()
    };
    assert_eq!(stats.hit_ratio(), 0.75);
  }
}
