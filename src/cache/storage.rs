//! Local Store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::traits::{CachedCollection, Cacheable, CollectionKind};
use crate::error::{Error, Result};

/// A cached app setting blob.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSetting {
  pub data: Value,
  pub updated_at: DateTime<Utc>,
}

/// Counters reported by `LocalStore::stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
  pub scopes: u64,
  pub collections: u64,
  pub items: u64,
  pub settings: u64,
  pub oldest_fetched_at: Option<DateTime<Utc>>,
  pub newest_fetched_at: Option<DateTime<Utc>>,
}

/// Trait for Local Store backends.
///
/// Every write is a single logical transaction: readers never observe a
/// partially written collection.
pub trait LocalStore: Send + Sync + 'static {
  /// Read the full snapshot of one collection.
  fn read<T: Cacheable>(&self, name: &str, scope_id: &str) -> Result<Option<CachedCollection<T>>>;

  /// Atomically replace one collection.
  fn write<T: Cacheable>(&self, collection: &CachedCollection<T>) -> Result<()>;

  /// Append documents, replacing in place any whose key is already present.
  ///
  /// Creates the collection when missing. `total_count`, when given,
  /// overwrites the stored server total.
  fn append_items<T: Cacheable>(
    &self,
    name: &str,
    scope_id: &str,
    kind: CollectionKind,
    items: &[T],
    total_count: Option<u64>,
  ) -> Result<()>;

  fn delete(&self, name: &str, scope_id: &str) -> Result<()>;

  /// Remove every collection and setting of a scope.
  fn clear_scope(&self, scope_id: &str) -> Result<()>;

  fn clear_all(&self) -> Result<()>;

  fn read_setting(&self, scope_id: &str, name: &str) -> Result<Option<StoredSetting>>;

  fn write_setting(&self, scope_id: &str, name: &str, data: &Value) -> Result<()>;

  fn delete_setting(&self, scope_id: &str, name: &str) -> Result<()>;

  /// Counters for one scope, or for the whole store when `scope_id` is None.
  fn stats(&self, scope_id: Option<&str>) -> Result<StoreStats>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl LocalStore for NoopStore {
  fn read<T: Cacheable>(
    &self,
    _name: &str,
    _scope_id: &str,
  ) -> Result<Option<CachedCollection<T>>> {
    Ok(None) // Always miss
  }

  fn write<T: Cacheable>(&self, _collection: &CachedCollection<T>) -> Result<()> {
    Ok(()) // Discard
  }

  fn append_items<T: Cacheable>(
    &self,
    _name: &str,
    _scope_id: &str,
    _kind: CollectionKind,
    _items: &[T],
    _total_count: Option<u64>,
  ) -> Result<()> {
    Ok(())
  }

  fn delete(&self, _name: &str, _scope_id: &str) -> Result<()> {
    Ok(())
  }

  fn clear_scope(&self, _scope_id: &str) -> Result<()> {
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    Ok(())
  }

  fn read_setting(&self, _scope_id: &str, _name: &str) -> Result<Option<StoredSetting>> {
    Ok(None)
  }

  fn write_setting(&self, _scope_id: &str, _name: &str, _data: &Value) -> Result<()> {
    Ok(())
  }

  fn delete_setting(&self, _scope_id: &str, _name: &str) -> Result<()> {
    Ok(())
  }

  fn stats(&self, _scope_id: Option<&str>) -> Result<StoreStats> {
    Ok(StoreStats::default())
  }
}

/// SQLite-based Local Store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    debug!(path = %path.display(), "opened cache database");
    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("Could not determine data directory".into()))?;

    Ok(data_dir.join("chatcache").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run cache migrations: {}", e)))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cached collection, partitioned by scope
CREATE TABLE IF NOT EXISTS collections (
    scope_id TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    total_count INTEGER NOT NULL,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (scope_id, name)
);

-- Collection members (serialized JSON), ordered by position
CREATE TABLE IF NOT EXISTS collection_items (
    scope_id TEXT NOT NULL,
    name TEXT NOT NULL,
    item_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (scope_id, name, item_key)
);

CREATE INDEX IF NOT EXISTS idx_collection_items_order
    ON collection_items(scope_id, name, position);

-- Free-form app settings (quick replies, templates, chat rules, ...)
CREATE TABLE IF NOT EXISTS app_settings (
    scope_id TEXT NOT NULL,
    name TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (scope_id, name)
);
"#;

impl LocalStore for SqliteStore {
  fn read<T: Cacheable>(&self, name: &str, scope_id: &str) -> Result<Option<CachedCollection<T>>> {
    let conn = self.lock()?;

    let meta: Option<(String, i64, String)> = conn
      .query_row(
        "SELECT kind, total_count, fetched_at FROM collections
         WHERE scope_id = ? AND name = ? AND entity_type = ?",
        params![scope_id, name, T::entity_type()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let (kind, total_count, fetched_at) = match meta {
      Some(meta) => meta,
      None => return Ok(None),
    };

    let mut stmt = conn.prepare(
      "SELECT item_key, data FROM collection_items
       WHERE scope_id = ? AND name = ?
       ORDER BY position",
    )?;

    let rows = stmt
      .query_map(params![scope_id, name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for (key, data) in rows {
      match serde_json::from_slice::<T>(&data) {
        Ok(item) => items.push(item),
        Err(e) => {
          warn!(collection = name, key = %key, error = %e, "skipping undecodable cached item")
        }
      }
    }

    Ok(Some(CachedCollection {
      name: name.to_string(),
      scope_id: scope_id.to_string(),
      kind: parse_kind(&kind)?,
      items,
      total_count: total_count.max(0) as u64,
      fetched_at: parse_datetime(&fetched_at)?,
    }))
  }

  fn write<T: Cacheable>(&self, collection: &CachedCollection<T>) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let name = collection.name.as_str();
    let scope_id = collection.scope_id.as_str();

    tx.execute(
      "DELETE FROM collection_items WHERE scope_id = ? AND name = ?",
      params![scope_id, name],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO collections
         (scope_id, name, kind, entity_type, total_count, fetched_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        scope_id,
        name,
        collection.kind.as_str(),
        T::entity_type(),
        collection.total_count as i64,
        format_datetime(collection.fetched_at),
      ],
    )?;

    for (position, item) in dedup_by_key(&collection.items).into_iter().enumerate() {
      insert_item(&tx, scope_id, name, position as i64, item)?;
    }

    tx.commit()?;
    Ok(())
  }

  fn append_items<T: Cacheable>(
    &self,
    name: &str,
    scope_id: &str,
    kind: CollectionKind,
    items: &[T],
    total_count: Option<u64>,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let existing: Option<i64> = tx
      .query_row(
        "SELECT total_count FROM collections WHERE scope_id = ? AND name = ?",
        params![scope_id, name],
        |row| row.get(0),
      )
      .optional()?;

    match (existing, total_count) {
      (None, total) => {
        tx.execute(
          "INSERT INTO collections (scope_id, name, kind, entity_type, total_count, fetched_at)
           VALUES (?, ?, ?, ?, ?, ?)",
          params![
            scope_id,
            name,
            kind.as_str(),
            T::entity_type(),
            total.unwrap_or(items.len() as u64) as i64,
            format_datetime(Utc::now()),
          ],
        )?;
      }
      (Some(_), Some(total)) => {
        tx.execute(
          "UPDATE collections SET total_count = ? WHERE scope_id = ? AND name = ?",
          params![total as i64, scope_id, name],
        )?;
      }
      (Some(_), None) => {}
    }

    let mut next_position: i64 = tx.query_row(
      "SELECT COALESCE(MAX(position), -1) + 1 FROM collection_items
       WHERE scope_id = ? AND name = ?",
      params![scope_id, name],
      |row| row.get(0),
    )?;

    for item in dedup_by_key(items) {
      let key = item.cache_key();
      // Existing key: latest version wins, position kept
      let updated = if key.is_empty() {
        0
      } else {
        tx.execute(
          "UPDATE collection_items SET data = ?
           WHERE scope_id = ? AND name = ? AND item_key = ?",
          params![serde_json::to_vec(item)?, scope_id, name, key],
        )?
      };
      if updated == 0 {
        insert_item(&tx, scope_id, name, next_position, item)?;
        next_position += 1;
      }
    }

    tx.commit()?;
    Ok(())
  }

  fn delete(&self, name: &str, scope_id: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM collection_items WHERE scope_id = ? AND name = ?",
      params![scope_id, name],
    )?;
    tx.execute(
      "DELETE FROM collections WHERE scope_id = ? AND name = ?",
      params![scope_id, name],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn clear_scope(&self, scope_id: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for table in ["collection_items", "collections", "app_settings"] {
      tx.execute(
        &format!("DELETE FROM {} WHERE scope_id = ?", table),
        params![scope_id],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    let conn = self.lock()?;
    conn.execute_batch(
      "BEGIN;
       DELETE FROM collection_items;
       DELETE FROM collections;
       DELETE FROM app_settings;
       COMMIT;",
    )?;
    Ok(())
  }

  fn read_setting(&self, scope_id: &str, name: &str) -> Result<Option<StoredSetting>> {
    let conn = self.lock()?;
    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, updated_at FROM app_settings WHERE scope_id = ? AND name = ?",
        params![scope_id, name],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, updated_at)) => Ok(Some(StoredSetting {
        data: serde_json::from_slice(&data)?,
        updated_at: parse_datetime(&updated_at)?,
      })),
      None => Ok(None),
    }
  }

  fn write_setting(&self, scope_id: &str, name: &str, data: &Value) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO app_settings (scope_id, name, data, updated_at)
       VALUES (?, ?, ?, ?)",
      params![scope_id, name, serde_json::to_vec(data)?, format_datetime(Utc::now())],
    )?;
    Ok(())
  }

  fn delete_setting(&self, scope_id: &str, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM app_settings WHERE scope_id = ? AND name = ?",
      params![scope_id, name],
    )?;
    Ok(())
  }

  fn stats(&self, scope_id: Option<&str>) -> Result<StoreStats> {
    let conn = self.lock()?;
    // NULL scope matches every row
    let (scopes, collections, oldest, newest): (i64, i64, Option<String>, Option<String>) = conn
      .query_row(
        "SELECT COUNT(DISTINCT scope_id), COUNT(*), MIN(fetched_at), MAX(fetched_at)
         FROM collections WHERE ?1 IS NULL OR scope_id = ?1",
        params![scope_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )?;
    let items: i64 = conn.query_row(
      "SELECT COUNT(*) FROM collection_items WHERE ?1 IS NULL OR scope_id = ?1",
      params![scope_id],
      |row| row.get(0),
    )?;
    let settings: i64 = conn.query_row(
      "SELECT COUNT(*) FROM app_settings WHERE ?1 IS NULL OR scope_id = ?1",
      params![scope_id],
      |row| row.get(0),
    )?;

    Ok(StoreStats {
      scopes: scopes as u64,
      collections: collections as u64,
      items: items as u64,
      settings: settings as u64,
      oldest_fetched_at: oldest.as_deref().map(parse_datetime).transpose()?,
      newest_fetched_at: newest.as_deref().map(parse_datetime).transpose()?,
    })
  }
}

fn insert_item<T: Cacheable>(
  tx: &Transaction<'_>,
  scope_id: &str,
  name: &str,
  position: i64,
  item: &T,
) -> Result<()> {
  let data = serde_json::to_vec(item)?;
  // Keyless documents are stored under their position
  let key = match item.cache_key() {
    key if key.is_empty() => format!("#{}", position),
    key => key,
  };
  tx.execute(
    "INSERT OR REPLACE INTO collection_items (scope_id, name, item_key, position, data)
     VALUES (?, ?, ?, ?, ?)",
    params![scope_id, name, key, position, data],
  )?;
  Ok(())
}

/// Collapse duplicate keys: first position wins, latest version wins.
///
/// Keyless documents are never duplicates of each other.
pub(crate) fn dedup_by_key<T: Cacheable>(items: &[T]) -> Vec<&T> {
  let mut index: HashMap<String, usize> = HashMap::with_capacity(items.len());
  let mut out: Vec<&T> = Vec::with_capacity(items.len());
  for item in items {
    let key = item.cache_key();
    if key.is_empty() {
      out.push(item);
      continue;
    }
    match index.get(&key) {
      Some(&i) => out[i] = item,
      None => {
        index.insert(key, out.len());
        out.push(item);
      }
    }
  }
  out
}

fn parse_kind(s: &str) -> Result<CollectionKind> {
  match s {
    "chats" => Ok(CollectionKind::Chats),
    "messages" => Ok(CollectionKind::Messages),
    "settings" => Ok(CollectionKind::Settings),
    other => Err(Error::Storage(format!("unknown collection kind '{}'", other))),
  }
}

/// Fixed-width UTC timestamps so MIN/MAX compare chronologically.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn docs(values: Vec<Value>) -> CachedCollection<Value> {
    CachedCollection::new("quick", "scope-a", CollectionKind::Settings, values, 2)
  }

  #[test]
  fn test_write_then_read_preserves_order() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .write(&docs(vec![json!({"_id": "b"}), json!({"_id": "a"})]))
      .unwrap();

    let read = store.read::<Value>("quick", "scope-a").unwrap().unwrap();
    let keys: Vec<_> = read.items.iter().map(|v| v.cache_key()).collect();
    assert_eq!(keys, vec!["b", "a"]);
    assert_eq!(read.total_count, 2);
    assert_eq!(read.kind, CollectionKind::Settings);
  }

  #[test]
  fn test_write_replaces_previous_snapshot() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .write(&docs(vec![json!({"_id": "1"}), json!({"_id": "2"})]))
      .unwrap();
    store.write(&docs(vec![json!({"_id": "3"})])).unwrap();

    let read = store.read::<Value>("quick", "scope-a").unwrap().unwrap();
    assert_eq!(read.items, vec![json!({"_id": "3"})]);
  }

  #[test]
  fn test_append_dedups_and_updates_in_place() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .write(&docs(vec![json!({"_id": 1}), json!({"_id": 2})]))
      .unwrap();

    store
      .append_items(
        "quick",
        "scope-a",
        CollectionKind::Settings,
        &[json!({"_id": 2, "v": "new"}), json!({"_id": 3})],
        Some(3),
      )
      .unwrap();

    let read = store.read::<Value>("quick", "scope-a").unwrap().unwrap();
    assert_eq!(
      read.items,
      vec![json!({"_id": 1}), json!({"_id": 2, "v": "new"}), json!({"_id": 3})]
    );
    assert_eq!(read.total_count, 3);
  }

  #[test]
  fn test_append_creates_missing_collection() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .append_items(
        "fresh",
        "scope-a",
        CollectionKind::Messages,
        &[json!({"_id": "x"})],
        None,
      )
      .unwrap();

    let read = store.read::<Value>("fresh", "scope-a").unwrap().unwrap();
    assert_eq!(read.items.len(), 1);
    assert_eq!(read.total_count, 1);
  }

  #[test]
  fn test_scope_isolation() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.write(&docs(vec![json!({"_id": "a"})])).unwrap();
    store
      .write_setting("scope-a", "templates", &json!(["t1"]))
      .unwrap();

    assert!(store.read::<Value>("quick", "scope-b").unwrap().is_none());
    assert!(store.read_setting("scope-b", "templates").unwrap().is_none());
  }

  #[test]
  fn test_read_checks_entity_type() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.write(&docs(vec![json!({"_id": "a"})])).unwrap();
    assert!(store
      .read::<crate::model::Chat>("quick", "scope-a")
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_clear_scope_leaves_other_scopes() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.write(&docs(vec![json!({"_id": "a"})])).unwrap();
    let mut other = docs(vec![json!({"_id": "b"})]);
    other.scope_id = "scope-b".into();
    store.write(&other).unwrap();
    store.write_setting("scope-a", "rules", &json!({})).unwrap();

    store.clear_scope("scope-a").unwrap();

    assert!(store.read::<Value>("quick", "scope-a").unwrap().is_none());
    assert!(store.read_setting("scope-a", "rules").unwrap().is_none());
    assert!(store.read::<Value>("quick", "scope-b").unwrap().is_some());

    store.clear_all().unwrap();
    assert_eq!(store.stats(None).unwrap(), StoreStats::default());
  }

  #[test]
  fn test_stats_by_scope() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .write(&docs(vec![json!({"_id": "a"}), json!({"_id": "b"})]))
      .unwrap();
    let mut other = docs(vec![json!({"_id": "c"})]);
    other.scope_id = "scope-b".into();
    store.write(&other).unwrap();
    store.write_setting("scope-a", "rules", &json!({})).unwrap();

    let a = store.stats(Some("scope-a")).unwrap();
    assert_eq!((a.scopes, a.collections, a.items, a.settings), (1, 1, 2, 1));

    let all = store.stats(None).unwrap();
    assert_eq!((all.scopes, all.collections, all.items), (2, 2, 3));
    assert!(all.oldest_fetched_at.is_some());
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.write(&docs(vec![json!({"_id": "kept"})])).unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    let read = store.read::<Value>("quick", "scope-a").unwrap().unwrap();
    assert_eq!(read.items, vec![json!({"_id": "kept"})]);
  }

  #[test]
  fn test_noop_store_always_misses() {
    let store = NoopStore;
    store.write(&docs(vec![json!({"_id": "a"})])).unwrap();
    assert!(store.read::<Value>("quick", "scope-a").unwrap().is_none());
  }

  #[test]
  fn test_keyless_documents_are_kept_apart() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .write(&docs(vec![json!({"text": "Hi"}), json!({"text": "Bye"}), json!({"_id": "a"})]))
      .unwrap();
    store
      .append_items(
        "quick",
        "scope-a",
        CollectionKind::Settings,
        &[json!({"text": "Later"}), json!({"_id": "a", "text": "edited"})],
        None,
      )
      .unwrap();

    let read = store.read::<Value>("quick", "scope-a").unwrap().unwrap();
    assert_eq!(
      read.items,
      vec![
        json!({"text": "Hi"}),
        json!({"text": "Bye"}),
        json!({"_id": "a", "text": "edited"}),
        json!({"text": "Later"}),
      ]
    );
  }
}
