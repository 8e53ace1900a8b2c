//! Durable queue of failed mutations, replayed in enqueue order when the
//! host signals that connectivity is back.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::net::{Fetcher, HttpRequest};

/// A write request that failed while offline. Created on failure, never
/// mutated, deleted only after a confirmed successful replay.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
  pub id: String,
  pub method: String,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedMutation {
  fn to_request(&self) -> HttpRequest {
    HttpRequest {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      destination: None,
    }
  }
}

/// Storage backend for the mutation queue. Pure storage; replay policy lives
/// in [`MutationQueue`].
pub trait QueueStore: Send + Sync {
  /// Append at the tail.
  fn append(&self, mutation: &QueuedMutation) -> Result<()>;

  /// Every pending mutation, oldest first.
  fn oldest_first(&self) -> Result<Vec<QueuedMutation>>;

  fn remove(&self, id: &str) -> Result<()>;

  fn len(&self) -> Result<usize>;
}

/// Schema for the mutation queue table.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutation_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at TEXT NOT NULL
);
"#;

/// SQLite-backed queue; one row per pending mutation, FIFO by `seq`.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

impl SqliteQueue {
  /// Open the queue, creating the database and schema if needed.
  /// Shares the cache database file by default.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    let queue = Self {
      conn: Mutex::new(conn),
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  fn default_path() -> Result<PathBuf> {
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
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }
}

impl QueueStore for SqliteQueue {
  fn append(&self, mutation: &QueuedMutation) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO mutation_queue (id, method, url, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          mutation.id,
          mutation.method,
          mutation.url,
          headers,
          mutation.body,
          mutation.enqueued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to append mutation: {}", e))?;

    Ok(())
  }

  fn oldest_first(&self) -> Result<Vec<QueuedMutation>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, body, enqueued_at FROM mutation_queue
         ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(String, String, String, String, Option<Vec<u8>>, String)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query mutations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut mutations = Vec::with_capacity(rows.len());
    for (id, method, url, headers, body, enqueued_at) in rows {
      let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
        .map_err(|e| eyre!("Corrupt queued headers: {}", e))?;
      let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| eyre!("Corrupt enqueue timestamp: {}", e))?;
      mutations.push(QueuedMutation {
        id,
        method,
        url,
        headers,
        body,
        enqueued_at,
      });
    }

    Ok(mutations)
  }

  fn remove(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM mutation_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation: {}", e))?;

    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM mutation_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count mutations: {}", e))?;

    Ok(count as usize)
  }
}

/// In-memory queue for tests.
#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryQueue {
  entries: Mutex<Vec<QueuedMutation>>,
}

#[allow(dead_code)]
impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }
}

impl QueueStore for MemoryQueue {
  fn append(&self, mutation: &QueuedMutation) -> Result<()> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(mutation.clone());
    Ok(())
  }

  fn oldest_first(&self) -> Result<Vec<QueuedMutation>> {
    Ok(
      self
        .entries
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .clone(),
    )
  }

  fn remove(&self, id: &str) -> Result<()> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .retain(|m| m.id != id);
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    Ok(
      self
        .entries
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .len(),
    )
  }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
  pub replayed: usize,
  pub remaining: usize,
}

/// Replay policy over a queue store.
///
/// Only one drain runs at a time; a trigger while one is in flight is a
/// no-op. New enqueues never wait for a drain.
pub struct MutationQueue<Q: QueueStore> {
  store: Arc<Q>,
  drain_lock: tokio::sync::Mutex<()>,
}

impl<Q: QueueStore> MutationQueue<Q> {
  pub fn new(store: Q) -> Self {
    Self {
      store: Arc::new(store),
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Park a mutating request that could not reach the origin.
  pub fn enqueue(&self, request: &HttpRequest) -> Result<QueuedMutation> {
    let enqueued_at = Utc::now();
    let mutation = QueuedMutation {
      id: mutation_id(&request.method, &request.url, enqueued_at),
      method: request.method.clone(),
      url: request.url.clone(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at,
    };

    self.store.append(&mutation)?;
    info!(id = %mutation.id, method = %mutation.method, url = %mutation.url, "queued mutation for replay");
    Ok(mutation)
  }

  #[allow(dead_code)]
  pub fn len(&self) -> Result<usize> {
    self.store.len()
  }

  /// Replay pending mutations, oldest first. A mutation is removed only on
  /// a 2xx response; anything else leaves it in place at its position, and
  /// iteration moves on so a younger mutation is never attempted before an
  /// older one. Entries that keep failing simply stay queued.
  pub async fn drain_and_replay(&self, fetcher: &dyn Fetcher) -> Result<ReplayReport> {
    let Ok(_guard) = self.drain_lock.try_lock() else {
      return Ok(ReplayReport {
        replayed: 0,
        remaining: self.store.len()?,
      });
    };

    let mut replayed = 0;
    for mutation in self.store.oldest_first()? {
      match fetcher.fetch(&mutation.to_request()).await {
        Ok(response) if response.is_success() => {
          self.store.remove(&mutation.id)?;
          replayed += 1;
        }
        Ok(response) => {
          warn!(id = %mutation.id, status = response.status, "replay rejected, mutation stays queued");
        }
        Err(error) => {
          warn!(id = %mutation.id, %error, "replay failed, mutation stays queued");
        }
      }
    }

    let remaining = self.store.len()?;
    if replayed > 0 || remaining > 0 {
      info!(replayed, remaining, "queue drain finished");
    }
    Ok(ReplayReport {
      replayed,
      remaining,
    })
  }
}

/// Short unique id for a queued mutation. The counter keeps two enqueues in
/// the same clock tick distinct.
fn mutation_id(method: &str, url: &str, at: DateTime<Utc>) -> String {
  static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
  let seq = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

  let mut hasher = Sha256::new();
  hasher.update(method.as_bytes());
  hasher.update(url.as_bytes());
  hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
  hasher.update(seq.to_le_bytes());
  let mut digest = hex::encode(hasher.finalize());
  digest.truncate(16);
  digest
}
