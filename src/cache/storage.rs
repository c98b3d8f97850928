//! Cache store trait and its backends (in-memory, SQLite, no-op).

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{CacheEntry, CacheKey, Validators};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("lock poisoned: {0}")]
  Poisoned(String),
  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to encode cached headers: {0}")]
  Encoding(#[from] serde_json::Error),
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
  #[error("corrupt cache row: {0}")]
  Corrupt(String),
  #[error("refusing to cache status {0}")]
  Uncacheable(u16),
}

/// Which entries a deletion applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
  Exact(CacheKey),
  /// Entries whose path equals the prefix or lies beneath it
  PathPrefix(String),
  /// Entries whose operation matches a glob (`*` matches any run)
  Operation(String),
}

impl Selector {
  pub fn matches(&self, entry: &CacheEntry) -> bool {
    match self {
      Selector::Exact(key) => &entry.key == key,
      Selector::PathPrefix(prefix) => path_under(&entry.path, prefix),
      Selector::Operation(pattern) => glob_match(pattern, &entry.operation),
    }
  }
}

fn path_under(path: &str, prefix: &str) -> bool {
  let prefix = prefix.trim_end_matches('/');
  if prefix.is_empty() {
    return true;
  }
  match path.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with('/'),
    None => false,
  }
}

/// Minimal glob: `*` matches any (possibly empty) run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
  let mut parts = pattern.split('*');
  let first = parts.next().unwrap_or_default();
  let Some(mut rest) = text.strip_prefix(first) else {
    return false;
  };

  let tail: Vec<&str> = parts.collect();
  let Some((last, middle)) = tail.split_last() else {
    // no wildcard at all
    return rest.is_empty();
  };

  for part in middle {
    match rest.find(part) {
      Some(idx) => rest = &rest[idx + part.len()..],
      None => return false,
    }
  }
  rest.len() >= last.len() && rest.ends_with(last)
}

/// Rewrite a [`glob_match`] pattern for SQLite `GLOB`, where `?` and `[`
/// are also wildcards.
fn sqlite_glob(pattern: &str) -> String {
  let mut out = String::with_capacity(pattern.len());
  for c in pattern.chars() {
    match c {
      '?' => out.push_str("[?]"),
      '[' => out.push_str("[[]"),
      _ => out.push(c),
    }
  }
  out
}

/// Size of the live portion of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
  pub total_entries: u64,
  pub total_bytes: u64,
}

/// Trait for cache storage backends.
///
/// Implementations are shared across concurrent callers; a reader never
/// observes a partially written entry.
pub trait CacheStore: Send + Sync {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

  /// Insert or replace the entry under its key.
  fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

  /// Remove matching entries, returning how many were removed.
  fn delete(&self, selector: &Selector) -> Result<usize, StoreError>;

  /// Count and size of unexpired entries.
  fn stats(&self) -> Result<StoreStats, StoreError>;

  fn clear(&self) -> Result<(), StoreError>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
    Ok(None) // Always miss
  }

  fn put(&self, _entry: CacheEntry) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn delete(&self, _selector: &Selector) -> Result<usize, StoreError> {
    Ok(0)
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    Ok(StoreStats::default())
  }

  fn clear(&self) -> Result<(), StoreError> {
    Ok(())
  }
}

/// Process-local store backed by a hash map.
pub struct MemoryStore {
  entries: RwLock<HashMap<CacheKey, CacheEntry>>,
  capacity: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      capacity: None,
    }
  }

  /// Bound the number of entries; inserting into a full store purges
  /// expired entries first, then evicts the oldest.
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      entries: RwLock::new(HashMap::with_capacity(capacity.min(1024))),
      capacity: Some(capacity.max(1)),
    }
  }

  fn make_room(entries: &mut HashMap<CacheKey, CacheEntry>, capacity: usize) {
    if entries.len() < capacity {
      return;
    }
    let now = Utc::now();
    entries.retain(|_, e| !e.is_expired_at(now));

    while entries.len() >= capacity {
      let oldest = entries
        .values()
        .min_by_key(|e| e.stored_at)
        .map(|e| e.key.clone());
      match oldest {
        Some(key) => {
          entries.remove(&key);
        }
        None => break,
      }
    }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStore for MemoryStore {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
    Ok(self.entries.read().get(key).cloned())
  }

  fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
    let mut entries = self.entries.write();
    if let Some(capacity) = self.capacity {
      if !entries.contains_key(&entry.key) {
        Self::make_room(&mut entries, capacity);
      }
    }
    entries.insert(entry.key.clone(), entry);
    Ok(())
  }

  fn delete(&self, selector: &Selector) -> Result<usize, StoreError> {
    let mut entries = self.entries.write();
    if let Selector::Exact(key) = selector {
      return Ok(entries.remove(key).map_or(0, |_| 1));
    }
    let before = entries.len();
    entries.retain(|_, e| !selector.matches(e));
    Ok(before - entries.len())
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    let now = Utc::now();
    let entries = self.entries.read();
    let live = entries.values().filter(|e| !e.is_expired_at(now));
    let (count, bytes) = live.fold((0u64, 0u64), |(c, b), e| (c + 1, b + e.size() as u64));
    Ok(StoreStats {
      total_entries: count,
      total_bytes: bytes,
    })
  }

  fn clear(&self) -> Result<(), StoreError> {
    self.entries.write().clear();
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`, or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    Self::with_connection(Connection::open(&path)?)
  }

  /// Private in-memory database, used by tests and ephemeral runs.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        StoreError::Io(std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "could not determine data directory",
        ))
      })?;

    Ok(data_dir.join("jira-conduit").join("http-cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

/// Schema for the response cache.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS http_cache (
    cache_key TEXT PRIMARY KEY,
    operation TEXT NOT NULL,
    path TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    etag TEXT,
    last_modified TEXT,
    stored_at TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_http_cache_path ON http_cache(path);
CREATE INDEX IF NOT EXISTS idx_http_cache_operation ON http_cache(operation);
CREATE INDEX IF NOT EXISTS idx_http_cache_expires ON http_cache(expires_at);
"#;

/// Fixed-width UTC timestamps so lexical order is chronological order.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

type Row = (
  String,
  String,
  String,
  i64,
  String,
  Vec<u8>,
  Option<String>,
  Option<String>,
  String,
  i64,
);

fn entry_from_row(row: Row) -> Result<CacheEntry, StoreError> {
  let (key, operation, path, status, headers, body, etag, last_modified, stored_at, ttl_ms) = row;
  let status = u16::try_from(status).map_err(|_| StoreError::Corrupt(format!("status {}", status)))?;

  Ok(CacheEntry {
    key: CacheKey::new(key),
    operation,
    path,
    status,
    headers: serde_json::from_str(&headers)?,
    body: body.into(),
    validators: Validators {
      etag,
      last_modified,
    },
    stored_at: parse_datetime(&stored_at)?,
    ttl: Duration::from_millis(ttl_ms.max(0) as u64),
  })
}

impl CacheStore for SqliteStore {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare_cached(
      "SELECT cache_key, operation, path, status, headers, body, etag, last_modified, stored_at, ttl_ms
       FROM http_cache WHERE cache_key = ?",
    )?;

    let row: Option<Row> = stmt
      .query_row(params![key.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
          row.get(7)?,
          row.get(8)?,
          row.get(9)?,
        ))
      })
      .optional()?;

    row.map(entry_from_row).transpose()
  }

  fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
    let headers = serde_json::to_string(&entry.headers)?;
    let ttl_ms = i64::try_from(entry.ttl.as_millis()).unwrap_or(i64::MAX);

    self.lock()?.execute(
      "INSERT OR REPLACE INTO http_cache
         (cache_key, operation, path, status, headers, body, etag, last_modified, stored_at, ttl_ms, expires_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        entry.key.as_str(),
        entry.operation,
        entry.path,
        entry.status as i64,
        headers,
        entry.body.as_ref(),
        entry.validators.etag,
        entry.validators.last_modified,
        format_datetime(entry.stored_at),
        ttl_ms,
        format_datetime(entry.expires_at()),
      ],
    )?;
    Ok(())
  }

  fn delete(&self, selector: &Selector) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    let removed = match selector {
      Selector::Exact(key) => {
        conn.execute("DELETE FROM http_cache WHERE cache_key = ?", params![key.as_str()])?
      }
      Selector::PathPrefix(prefix) => {
        let prefix = prefix.trim_end_matches('/');
        conn.execute(
          "DELETE FROM http_cache
           WHERE ?1 = '' OR path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
          params![prefix],
        )?
      }
      Selector::Operation(pattern) => conn.execute(
        "DELETE FROM http_cache WHERE operation GLOB ?",
        params![sqlite_glob(pattern)],
      )?,
    };
    Ok(removed)
  }

  fn stats(&self) -> Result<StoreStats, StoreError> {
    let conn = self.lock()?;
    let (count, bytes): (i64, i64) = conn.query_row(
      "SELECT COUNT(*), COALESCE(SUM(LENGTH(body)), 0) FROM http_cache WHERE expires_at > ?",
      params![format_datetime(Utc::now())],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(StoreStats {
      total_entries: count.max(0) as u64,
      total_bytes: bytes.max(0) as u64,
    })
  }

  fn clear(&self) -> Result<(), StoreError> {
    self.lock()?.execute("DELETE FROM http_cache", [])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn entry(key: &str, operation: &str, path: &str) -> CacheEntry {
    CacheEntry {
      key: CacheKey::new(key),
      operation: operation.into(),
      path: path.into(),
      status: 200,
      headers: vec![("content-type".into(), "application/json".into())],
      body: Bytes::from(format!("{{\"key\":\"{}\"}}", key)),
      validators: Validators {
        etag: Some(format!("\"{}\"", key)),
        last_modified: None,
      },
      stored_at: Utc::now(),
      ttl: Duration::from_secs(60),
    }
  }

  fn expired(mut e: CacheEntry) -> CacheEntry {
    e.stored_at = Utc::now() - chrono::Duration::seconds(120);
    e
  }

  fn exercise_backend(store: &dyn CacheStore) {
    store
      .put(entry("a", "issues/get", "/rest/api/3/issue/PROJ-1"))
      .unwrap();
    store
      .put(entry("b", "issues/comments/list", "/rest/api/3/issue/PROJ-1/comment"))
      .unwrap();
    store
      .put(entry("c", "issues/get", "/rest/api/3/issue/PROJ-10"))
      .unwrap();
    store
      .put(entry("d", "issues/search", "/rest/api/3/search"))
      .unwrap();

    let got = store.get(&CacheKey::new("a")).unwrap().unwrap();
    assert_eq!(got.body, Bytes::from_static(b"{\"key\":\"a\"}"));
    assert_eq!(got.validators.etag.as_deref(), Some("\"a\""));
    assert_eq!(got.headers[0].1, "application/json");

    assert_eq!(store.stats().unwrap().total_entries, 4);

    // PROJ-10 shares a textual prefix with PROJ-1 but is a different resource
    let removed = store
      .delete(&Selector::PathPrefix("/rest/api/3/issue/PROJ-1".into()))
      .unwrap();
    assert_eq!(removed, 2);
    assert!(store.get(&CacheKey::new("c")).unwrap().is_some());

    let removed = store
      .delete(&Selector::Operation("issues/*".into()))
      .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.stats().unwrap().total_entries, 0);

    store.put(entry("e", "issues/get", "/x")).unwrap();
    assert_eq!(store.delete(&Selector::Exact(CacheKey::new("e"))).unwrap(), 1);
    assert_eq!(store.delete(&Selector::Exact(CacheKey::new("e"))).unwrap(), 0);

    store.put(expired(entry("f", "issues/get", "/y"))).unwrap();
    assert_eq!(store.stats().unwrap().total_entries, 0);
    // expired entries stay readable; expiry is the manager's call
    assert!(store.get(&CacheKey::new("f")).unwrap().is_some());

    store.clear().unwrap();
    assert!(store.get(&CacheKey::new("f")).unwrap().is_none());

    // only `*` is a wildcard, on every backend
    store.put(entry("g", "filters/[id]?", "/g")).unwrap();
    store.put(entry("h", "filters/i]x", "/h")).unwrap();
    let removed = store
      .delete(&Selector::Operation("filters/[id]?".into()))
      .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(&CacheKey::new("h")).unwrap().is_some());
    assert_eq!(
      store.delete(&Selector::Operation("filters/?*".into())).unwrap(),
      0
    );
  }

  #[test]
  fn test_memory_store() {
    exercise_backend(&MemoryStore::new());
  }

  #[test]
  fn test_sqlite_store() {
    exercise_backend(&SqliteStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_store_on_disk_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("jira-conduit-test-{}", std::process::id()));
    let path = dir.join("cache.db");
    {
      let store = SqliteStore::open(Some(&path)).unwrap();
      store.put(entry("persist", "issues/get", "/p")).unwrap();
    }
    let store = SqliteStore::open(Some(&path)).unwrap();
    let got = store.get(&CacheKey::new("persist")).unwrap().unwrap();
    assert_eq!(got.ttl, Duration::from_secs(60));
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn test_memory_store_capacity_evicts_expired_then_oldest() {
    let store = MemoryStore::with_capacity(2);
    store.put(expired(entry("old", "issues/get", "/1"))).unwrap();
    let mut x = entry("x", "issues/get", "/2");
    x.stored_at = Utc::now() - chrono::Duration::seconds(10);
    store.put(x).unwrap();
    store.put(entry("y", "issues/get", "/3")).unwrap();
    assert!(store.get(&CacheKey::new("old")).unwrap().is_none());
    assert!(store.get(&CacheKey::new("x")).unwrap().is_some());

    let mut newest = entry("z", "issues/get", "/4");
    newest.stored_at = Utc::now() + chrono::Duration::seconds(1);
    store.put(newest).unwrap();
    assert!(store.get(&CacheKey::new("x")).unwrap().is_none());
    assert!(store.get(&CacheKey::new("z")).unwrap().is_some());

    // replacing an existing key never evicts
    store.put(entry("z", "issues/get", "/4")).unwrap();
    assert!(store.get(&CacheKey::new("y")).unwrap().is_some());
  }

  #[test]
  fn test_noop_store_always_misses() {
    let store = NoopStore;
    store.put(entry("a", "issues/get", "/a")).unwrap();
    assert!(store.get(&CacheKey::new("a")).unwrap().is_none());
    assert_eq!(store.stats().unwrap(), StoreStats::default());
  }

  #[test]
  fn test_glob_match() {
    assert!(glob_match("issues/get", "issues/get"));
    assert!(!glob_match("issues/get", "issues/getx"));
    assert!(glob_match("projects/*", "projects/get"));
    assert!(glob_match("*search*", "users/search/query"));
    assert!(glob_match("*search*", "issues/search"));
    assert!(!glob_match("*search*", "issues/get"));
    assert!(glob_match("*", ""));
    assert!(!glob_match("a*a", "a"));
    assert!(!glob_match("a?c", "abc"));
  }

  #[test]
  fn test_sqlite_glob_escapes_wildcards() {
    assert_eq!(sqlite_glob("issues/*"), "issues/*");
    assert_eq!(sqlite_glob("a?[b]"), "a[?][[]b]");
  }
}
