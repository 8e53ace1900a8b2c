//! Partition store trait and cache entry types.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Synthetic header stamped onto stored entries, recording insertion time.
/// Used solely for staleness bookkeeping; consumers ignore it.
pub const FETCHED_AT_HEADER: &str = "x-holdfast-fetched-at";

/// A single cached response. Immutable once written; a later write for the
/// same key replaces it wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Age of this entry at `now`.
  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.inserted_at
  }
}

/// Why a store operation failed.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The durable medium rejected a write because its quota is exhausted.
  #[error("store quota exhausted")]
  QuotaExceeded,
  #[error("store backend error: {0}")]
  Backend(String),
}

/// Storage backend for the partitioned response cache.
///
/// Operates on qualified partition names (`holdfast-<generation>-<partition>`)
/// so that activation-time garbage collection can address partitions from
/// generations this build no longer declares. Pure storage; staleness and
/// quota policy live in [`super::PartitionCache`].
pub trait PartitionStore: Send + Sync {
  fn get(&self, partition: &str, key: &str) -> Result<Option<CacheEntry>, StoreError>;

  /// Overwrite semantics; last write wins.
  fn put(&self, partition: &str, key: &str, entry: &CacheEntry) -> Result<(), StoreError>;

  fn delete(&self, partition: &str, key: &str) -> Result<(), StoreError>;

  /// Qualified names of every partition with at least one entry.
  fn partition_names(&self) -> Result<Vec<String>, StoreError>;

  /// Drop every partition whose qualified name is not in `keep`.
  /// Returns the number of partitions removed.
  fn delete_partitions_not_in(&self, keep: &[String]) -> Result<usize, StoreError>;

  /// Delete entries inserted before their partition's cutoff.
  /// Returns the number of entries removed.
  fn sweep_expired(&self, cutoffs: &[(String, DateTime<Utc>)]) -> Result<usize, StoreError>;

  /// Delete every partition.
  fn purge_all(&self) -> Result<(), StoreError>;
}
