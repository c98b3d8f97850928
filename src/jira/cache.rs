//! Cache key and invalidation-scope derivation for Jira requests.

use reqwest::header::HeaderName;
use sha2::{Digest, Sha256};
use url::Url;

use crate::cache::CacheKey;

use super::types::OutboundRequest;

// ============================================================================
// Cache keys
// ============================================================================

/// Derive the cache key for a request.
///
/// The key covers operation, method, canonical path and query, plus the
/// values of `vary` headers so responses for one credential are never
/// served under another. Absent vary headers hash differently from empty
/// ones.
pub fn cache_key(request: &OutboundRequest, vary: &[HeaderName]) -> CacheKey {
  let mut input = format!(
    "{}|{}|{}|{}",
    request.operation,
    request.method,
    canonical_path(&request.url),
    canonical_query(&request.url)
  );

  for name in vary {
    input.push('|');
    input.push_str(name.as_str());
    match request.headers.get(name) {
      Some(value) => {
        input.push('=');
        input.push_str(&String::from_utf8_lossy(value.as_bytes()));
      }
      None => input.push('!'),
    }
  }

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  CacheKey::new(hex::encode(hasher.finalize()))
}

/// Path without a trailing slash; the root stays `/`.
pub fn canonical_path(url: &Url) -> String {
  let path = url.path();
  match path.trim_end_matches('/') {
    "" => "/".to_string(),
    trimmed => trimmed.to_string(),
  }
}

/// Query pairs sorted by name then value, re-encoded.
pub fn canonical_query(url: &Url) -> String {
  let mut pairs: Vec<(String, String)> = url
    .query_pairs()
    .map(|(k, v)| {
      let v = if k.eq_ignore_ascii_case("jql") {
        normalize_jql(&v)
      } else {
        v.into_owned()
      };
      (k.into_owned(), v)
    })
    .collect();
  pairs.sort();

  url::form_urlencoded::Serializer::new(String::new())
    .extend_pairs(pairs)
    .finish()
}

/// Normalize JQL for consistent hashing.
/// Trims whitespace and lowercases for case-insensitive matching.
fn normalize_jql(jql: &str) -> String {
  jql.trim().to_lowercase()
}

// ============================================================================
// Invalidation scope
// ============================================================================

/// Resource subtree a mutation may have affected.
///
/// Keeps the API root (`/rest/<api>/<version>`), then the collection and
/// identifier that follow it. Deeper segments (comments, transitions,
/// properties) belong to the same resource and are covered by the prefix.
///
/// `/rest/api/3/issue/PROJ-1/comment/10` -> `/rest/api/3/issue/PROJ-1`
/// `/rest/api/3/issue` (create) -> `/rest/api/3/issue`
/// `/some/other/path` -> `/some/other`
pub fn resource_prefix(url: &Url) -> String {
  let segments: Vec<&str> = url
    .path_segments()
    .map(|s| s.filter(|seg| !seg.is_empty()).collect())
    .unwrap_or_default();

  let version_at = segments
    .iter()
    .position(|seg| is_version_segment(seg) || *seg == "latest");

  let keep = match version_at {
    Some(idx) => (idx + 3).min(segments.len()),
    None => segments.len().saturating_sub(1).max(1).min(segments.len()),
  };

  if keep == 0 {
    return "/".to_string();
  }
  format!("/{}", segments[..keep].join("/"))
}

fn is_version_segment(seg: &str) -> bool {
  let mut parts = seg.split('.');
  parts
    .next()
    .is_some_and(|major| !major.is_empty() && major.chars().all(|c| c.is_ascii_digit()))
    && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
