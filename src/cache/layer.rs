//! Cache manager: hit/miss accounting, expiry and invalidation on top of a
//! store backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::policy::CachePolicy;
use super::storage::{CacheStore, MemoryStore, NoopStore, Selector, SqliteStore, StoreError};
use super::traits::{CacheEntry, CacheKey, CacheStats};
use crate::config::{CacheBackend, CacheConfig};

/// Operations invalidated after a mutation that has no explicit rule.
const FALLBACK_INVALIDATION: &str = "*search*";

/// Owns the cache store and the process-scoped hit/miss counters.
///
/// One manager is constructed per client and shared by reference; it is
/// safe to use from any number of concurrent callers.
pub struct CacheManager {
  policy: CachePolicy,
  store: Arc<dyn CacheStore>,
  invalidation_rules: HashMap<String, Vec<String>>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl CacheManager {
  /// Create a new manager with the given policy and storage backend.
  pub fn new(policy: CachePolicy, store: Arc<dyn CacheStore>) -> Self {
    Self {
      policy,
      store,
      invalidation_rules: HashMap::new(),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  /// Build the manager and its backend from configuration.
  pub fn from_config(config: &CacheConfig) -> Result<Self, StoreError> {
    let store: Arc<dyn CacheStore> = match (config.enabled, config.backend) {
      (false, _) | (_, CacheBackend::None) => Arc::new(NoopStore),
      (true, CacheBackend::Memory) => match config.max_entries {
        Some(capacity) => Arc::new(MemoryStore::with_capacity(capacity)),
        None => Arc::new(MemoryStore::new()),
      },
      (true, CacheBackend::Sqlite) => Arc::new(SqliteStore::open(config.sqlite_path.as_deref())?),
    };

    Ok(
      Self::new(CachePolicy::from_config(config), store)
        .with_invalidation_rules(config.invalidation_rules.clone()),
    )
  }

  /// Operation patterns to invalidate when a given mutation succeeds.
  pub fn with_invalidation_rules(mut self, rules: HashMap<String, Vec<String>>) -> Self {
    self.invalidation_rules = rules;
    self
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  /// Fetch a live entry, counting the hit or miss.
  ///
  /// Expired entries are treated as absent and removed. A failing store
  /// degrades to a miss.
  pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
    let found = match self.store.get(key) {
      Ok(found) => found,
      Err(e) => {
        warn!(cache_key = %key, error = %e, "cache read failed, treating as miss");
        None
      }
    };

    match found {
      Some(entry) if !entry.is_expired() => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
      }
      Some(_) => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.store.delete(&Selector::Exact(key.clone())) {
          debug!(cache_key = %key, error = %e, "failed to drop expired entry");
        }
        None
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  /// Persist a successful response, replacing any previous entry.
  pub fn store(&self, entry: CacheEntry) -> Result<(), StoreError> {
    if !(200..300).contains(&entry.status) {
      return Err(StoreError::Uncacheable(entry.status));
    }
    self.store.put(entry)
  }

  pub fn invalidate(&self, selector: &Selector) -> Result<usize, StoreError> {
    self.store.delete(selector)
  }

  /// Drop everything a mutation may have made stale: the resource subtree
  /// plus the operations its invalidation rule names.
  ///
  /// Best-effort; store errors are logged and skipped.
  pub fn invalidate_for_mutation(&self, operation: &str, resource_prefix: &str) -> usize {
    let mut selectors = vec![Selector::PathPrefix(resource_prefix.to_string())];
    match self.invalidation_rules.get(operation) {
      Some(targets) => selectors.extend(targets.iter().cloned().map(Selector::Operation)),
      None => selectors.push(Selector::Operation(FALLBACK_INVALIDATION.to_string())),
    }

    let mut removed = 0;
    for selector in &selectors {
      match self.store.delete(selector) {
        Ok(n) => removed += n,
        Err(e) => warn!(operation, ?selector, error = %e, "cache invalidation failed"),
      }
    }

    debug!(operation, resource_prefix, removed, "invalidated cache after mutation");
    removed
  }

  /// Point-in-time accounting snapshot. Counters are read without locking.
  pub fn stats(&self) -> CacheStats {
    let store = self.store.stats().unwrap_or_else(|e| {
      warn!(error = %e, "cache store stats unavailable");
      Default::default()
    });

    CacheStats {
      hit_count: self.hits.load(Ordering::Relaxed),
      miss_count: self.misses.load(Ordering::Relaxed),
      total_entries: store.total_entries,
      total_bytes: store.total_bytes,
    }
  }

  pub fn clear(&self) -> Result<(), StoreError> {
    self.store.clear()
  }
}
