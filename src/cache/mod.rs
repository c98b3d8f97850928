//! Generic HTTP response cache.
//!
//! This module is Jira-agnostic. It provides:
//! - A storage trait with in-memory, SQLite and no-op backends
//! - A policy deciding which operations are cacheable and for how long
//! - A manager that counts hits and misses, expires entries and applies
//!   coarse invalidation after mutations

mod layer;
mod policy;
mod storage;
mod traits;

pub use layer::CacheManager;
pub use policy::{CachePolicy, OperationClass};
pub use storage::{
  glob_match, CacheStore, MemoryStore, NoopStore, Selector, SqliteStore, StoreError, StoreStats,
};
pub use traits::{CacheEntry, CacheKey, CacheSource, CacheStats, Validators};
