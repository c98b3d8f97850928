//! Which requests may be cached, and for how long.

use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;

use super::storage::glob_match;
use crate::config::CacheConfig;

/// Floor applied to every computed TTL.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Coarse volatility class of an operation, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
  /// Result sets that change whenever any member changes
  Search,
  /// Single-resource reads
  Lookup,
  Other,
}

impl OperationClass {
  pub fn of(operation: &str) -> Self {
    let lower = operation.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
      .split(|c: char| matches!(c, '/' | '_' | '.' | '-' | ':'))
      .filter(|t| !t.is_empty())
      .collect();

    if tokens
      .iter()
      .any(|t| matches!(*t, "search" | "list" | "query" | "find"))
    {
      OperationClass::Search
    } else if tokens
      .iter()
      .any(|t| matches!(*t, "get" | "show" | "fetch" | "read" | "view"))
    {
      OperationClass::Lookup
    } else {
      OperationClass::Other
    }
  }
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
  enabled: bool,
  default_ttl: Duration,
  search_ttl: Duration,
  lookup_ttl: Duration,
  operation_ttls: HashMap<String, Duration>,
  /// Empty means every read is eligible
  allow: Vec<String>,
  deny: Vec<String>,
}

impl CachePolicy {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      enabled: config.enabled,
      default_ttl: config.default_ttl,
      search_ttl: config.search_ttl,
      lookup_ttl: config.lookup_ttl,
      operation_ttls: config.operation_ttls.clone(),
      allow: config.cacheable_operations.clone(),
      deny: config.non_cacheable_operations.clone(),
    }
  }

  pub fn with_ttl(mut self, operation: impl Into<String>, ttl: Duration) -> Self {
    self.operation_ttls.insert(operation.into(), ttl);
    self
  }

  /// Only reads are cacheable; operations may be excluded or allow-listed
  /// by glob.
  pub fn is_cacheable(&self, method: &Method, operation: &str) -> bool {
    if !self.enabled || *method != Method::GET {
      return false;
    }
    if self.deny.iter().any(|p| glob_match(p, operation)) {
      return false;
    }
    self.allow.is_empty() || self.allow.iter().any(|p| glob_match(p, operation))
  }

  /// Freshness lifetime for an operation's responses. Always positive.
  pub fn ttl_for(&self, operation: &str) -> Duration {
    let by_class = match OperationClass::of(operation) {
      OperationClass::Search => self.search_ttl,
      OperationClass::Lookup => self.lookup_ttl,
      OperationClass::Other => self.default_ttl,
    };

    [
      self.operation_ttls.get(operation).copied(),
      Some(by_class),
      Some(self.default_ttl),
    ]
    .into_iter()
    .flatten()
    .find(|ttl| !ttl.is_zero())
    .unwrap_or(MIN_TTL)
    .max(MIN_TTL)
  }
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self::from_config(&CacheConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_reads_are_cacheable() {
    let policy = CachePolicy::default();
    let cases = [
      (Method::GET, "issues/get", true),
      (Method::GET, "issues/search", true),
      (Method::POST, "issues/create", false),
      (Method::PUT, "issues/update", false),
      (Method::DELETE, "issues/delete", false),
      (Method::PATCH, "issues/update", false),
      (Method::POST, "issues/search", false),
      (Method::GET, "users/search", false),
      (Method::GET, "permissions/mine", false),
    ];
    for (method, op, expected) in cases {
      assert_eq!(
        policy.is_cacheable(&method, op),
        expected,
        "{} {}",
        method,
        op
      );
    }
  }

  #[test]
  fn test_allow_list_restricts() {
    let config = CacheConfig {
      cacheable_operations: vec!["issues/*".into()],
      ..Default::default()
    };
    let policy = CachePolicy::from_config(&config);
    assert!(policy.is_cacheable(&Method::GET, "issues/get"));
    assert!(!policy.is_cacheable(&Method::GET, "projects/get"));
  }

  #[test]
  fn test_disabled_caches_nothing() {
    let config = CacheConfig {
      enabled: false,
      ..Default::default()
    };
    assert!(!CachePolicy::from_config(&config).is_cacheable(&Method::GET, "issues/get"));
  }

  #[test]
  fn test_operation_class() {
    assert_eq!(OperationClass::of("issues/search"), OperationClass::Search);
    assert_eq!(OperationClass::of("projects/list"), OperationClass::Search);
    assert_eq!(OperationClass::of("search_issues"), OperationClass::Search);
    assert_eq!(OperationClass::of("issues/get"), OperationClass::Lookup);
    assert_eq!(OperationClass::of("get_issue"), OperationClass::Lookup);
    assert_eq!(OperationClass::of("target"), OperationClass::Other);
    assert_eq!(OperationClass::of("myself"), OperationClass::Other);
  }

  #[test]
  fn test_ttl_by_class_and_override() {
    let config = CacheConfig {
      operation_ttls: HashMap::new(),
      ..Default::default()
    };
    let policy = CachePolicy::from_config(&config);
    assert_eq!(policy.ttl_for("boards/search"), Duration::from_secs(120));
    assert_eq!(policy.ttl_for("boards/get"), Duration::from_secs(600));
    assert_eq!(policy.ttl_for("myself"), Duration::from_secs(300));
    assert!(policy.ttl_for("boards/search") < policy.ttl_for("boards/get"));

    let policy = policy.with_ttl("boards/get", Duration::from_secs(5));
    assert_eq!(policy.ttl_for("boards/get"), Duration::from_secs(5));
  }

  #[test]
  fn test_ttl_is_always_positive() {
    let config = CacheConfig {
      default_ttl: Duration::ZERO,
      search_ttl: Duration::ZERO,
      lookup_ttl: Duration::ZERO,
      operation_ttls: [("issues/get".to_string(), Duration::ZERO)].into(),
      ..Default::default()
    };
    let policy = CachePolicy::from_config(&config);
    for op in ["issues/get", "issues/search", "anything", ""] {
      assert!(!policy.ttl_for(op).is_zero(), "{}", op);
    }

    let policy = CachePolicy::default().with_ttl("issues/get", Duration::ZERO);
    assert_eq!(policy.ttl_for("issues/get"), Duration::from_secs(600));
  }
}
