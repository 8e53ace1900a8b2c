//! Partition store backends: SQLite for the real proxy, in-memory for tests.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CacheEntry, PartitionStore, StoreError};

/// Schema for the response cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    partition TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    PRIMARY KEY (partition, key)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_inserted
    ON response_cache(partition, inserted_at);
"#;

/// SQLite-backed partition store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store, creating the database and schema if needed.
  /// With no explicit path the platform data directory is used.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

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
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("holdfast").join("holdfast.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))
  }
}

/// Map a SQLite error, keeping quota exhaustion distinguishable.
fn store_err(e: rusqlite::Error) -> StoreError {
  match &e {
    rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::DiskFull => {
      StoreError::QuotaExceeded
    }
    _ => StoreError::Backend(e.to_string()),
  }
}

impl PartitionStore for SqliteStorage {
  fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, inserted_at FROM response_cache
         WHERE partition = ? AND key = ?",
      )
      .map_err(store_err)?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![partition, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, inserted_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| StoreError::Backend(format!("corrupt headers: {}", e)))?;
        let inserted_at = parse_timestamp(&inserted_at)?;
        Ok(Some(CacheEntry {
          key: key.to_string(),
          status,
          headers,
          body,
          inserted_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &str, entry: &CacheEntry) -> Result<(), StoreError> {
    let conn = self.lock()?;

    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| StoreError::Backend(format!("serialize headers: {}", e)))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (partition, key, status, headers, body, inserted_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          partition,
          key,
          entry.status,
          headers,
          entry.body,
          entry.inserted_at.to_rfc3339()
        ],
      )
      .map_err(store_err)?;

    Ok(())
  }

  fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM response_cache WHERE partition = ? AND key = ?",
        params![partition, key],
      )
      .map_err(store_err)?;
    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT partition FROM response_cache ORDER BY partition")
      .map_err(store_err)?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(store_err)?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_partitions_not_in(&self, keep: &[String]) -> Result<usize, StoreError> {
    let stale: Vec<String> = self
      .partition_names()?
      .into_iter()
      .filter(|name| !keep.contains(name))
      .collect();

    let conn = self.lock()?;
    for name in &stale {
      conn
        .execute("DELETE FROM response_cache WHERE partition = ?", params![name])
        .map_err(store_err)?;
    }

    Ok(stale.len())
  }

  fn sweep_expired(&self, cutoffs: &[(String, DateTime<Utc>)]) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    let mut removed = 0;
    for (partition, cutoff) in cutoffs {
      removed += conn
        .execute(
          "DELETE FROM response_cache WHERE partition = ? AND inserted_at < ?",
          params![partition, cutoff.to_rfc3339()],
        )
        .map_err(store_err)?;
    }
    Ok(removed)
  }

  fn purge_all(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM response_cache", [])
      .map_err(store_err)?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by `put`.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Backend(format!("corrupt timestamp '{}': {}", s, e)))
}

/// In-memory partition store: the injectable backend for deterministic tests.
/// An optional entry limit simulates quota exhaustion.
#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryStorage {
  partitions: Mutex<BTreeMap<String, BTreeMap<String, CacheEntry>>>,
  entry_limit: Option<usize>,
}

#[allow(dead_code)]
impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reject writes once the store holds `limit` entries, mimicking a durable
  /// medium with an exhausted quota.
  pub fn with_entry_limit(limit: usize) -> Self {
    Self {
      partitions: Mutex::new(BTreeMap::new()),
      entry_limit: Some(limit),
    }
  }

  fn lock(
    &self,
  ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, CacheEntry>>>, StoreError>
  {
    self
      .partitions
      .lock()
      .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))
  }
}

impl PartitionStore for MemoryStorage {
  fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .get(partition)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, partition: &str, key: &str, entry: &CacheEntry) -> Result<(), StoreError> {
    let mut partitions = self.lock()?;

    if let Some(limit) = self.entry_limit {
      let total: usize = partitions.values().map(|entries| entries.len()).sum();
      let replacing = partitions
        .get(partition)
        .map(|entries| entries.contains_key(key))
        .unwrap_or(false);
      if total >= limit && !replacing {
        return Err(StoreError::QuotaExceeded);
      }
    }

    partitions
      .entry(partition.to_string())
      .or_default()
      .insert(key.to_string(), entry.clone());
    Ok(())
  }

  fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError> {
    let mut partitions = self.lock()?;
    if let Some(entries) = partitions.get_mut(partition) {
      entries.remove(key);
    }
    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>, StoreError> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .iter()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  fn delete_partitions_not_in(&self, keep: &[String]) -> Result<usize, StoreError> {
    let mut partitions = self.lock()?;
    let before = partitions.len();
    partitions.retain(|name, _| keep.contains(name));
    Ok(before - partitions.len())
  }

  fn sweep_expired(&self, cutoffs: &[(String, DateTime<Utc>)]) -> Result<usize, StoreError> {
    let mut partitions = self.lock()?;
    let mut removed = 0;
    for (name, cutoff) in cutoffs {
      if let Some(entries) = partitions.get_mut(name) {
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at >= *cutoff);
        removed += before - entries.len();
      }
    }
    Ok(removed)
  }

  fn purge_all(&self) -> Result<(), StoreError> {
    let mut partitions = self.lock()?;
    partitions.clear();
    Ok(())
  }
}
