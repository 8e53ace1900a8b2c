//! Policy layer over partition storage: qualified names, staleness, quota
//! recovery, and generation garbage collection.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::classify::Partition;
use crate::net::HttpResponse;

use super::traits::{CacheEntry, PartitionStore, StoreError, FETCHED_AT_HEADER};

/// Prefix for qualified partition names in the durable store.
const NAME_PREFIX: &str = "holdfast";

/// Cache layer owning the partition policies for one generation.
///
/// Qualifies partition names as `holdfast-<generation>-<partition>`, computes
/// staleness from each partition's max age, and applies the quota recovery
/// policy on writes.
pub struct PartitionCache<S: PartitionStore> {
  store: Arc<S>,
  generation: String,
  max_ages: BTreeMap<Partition, Duration>,
}

impl<S: PartitionStore> PartitionCache<S> {
  pub fn new(store: S, generation: impl Into<String>, max_ages: BTreeMap<Partition, Duration>) -> Self {
    Self {
      store: Arc::new(store),
      generation: generation.into(),
      max_ages,
    }
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  /// Same store and policies under a different generation tag.
  #[allow(dead_code)]
  pub fn with_generation(&self, generation: impl Into<String>) -> Self {
    Self {
      store: Arc::clone(&self.store),
      generation: generation.into(),
      max_ages: self.max_ages.clone(),
    }
  }

  /// Qualified store name for a partition under the current generation.
  pub fn qualified_name(&self, partition: Partition) -> String {
    format!("{}-{}-{}", NAME_PREFIX, self.generation, partition.name())
  }

  /// Qualified names of every partition the current generation declares.
  pub fn keep_set(&self) -> Vec<String> {
    Partition::ALL
      .iter()
      .map(|partition| self.qualified_name(*partition))
      .collect()
  }

  pub fn max_age(&self, partition: Partition) -> Duration {
    self
      .max_ages
      .get(&partition)
      .copied()
      .unwrap_or_else(Duration::zero)
  }

  /// An entry is stale once its age exceeds its partition's max age.
  pub fn is_stale(&self, entry: &CacheEntry, partition: Partition) -> bool {
    entry.age(Utc::now()) > self.max_age(partition)
  }

  pub fn get(&self, partition: Partition, key: &str) -> Result<Option<CacheEntry>> {
    self
      .store
      .get(&self.qualified_name(partition), key)
      .map_err(|e| eyre!("Cache read failed for {}: {}", key, e))
  }

  /// Store a response, stamped with the insertion-time header.
  ///
  /// On quota exhaustion: sweep expired entries across all partitions, retry
  /// the write exactly once, then drop it silently — the in-flight response
  /// is returned to the caller either way. Concurrent writers for the same
  /// key race with last-write-wins semantics; that is accepted, not locked.
  pub fn insert(&self, partition: Partition, key: &str, response: &HttpResponse) -> Result<()> {
    let now = Utc::now();
    let mut headers = response.headers.clone();
    headers.insert(FETCHED_AT_HEADER.to_string(), now.to_rfc3339());

    let entry = CacheEntry {
      key: key.to_string(),
      status: response.status,
      headers,
      body: response.body.clone(),
      inserted_at: now,
    };

    let name = self.qualified_name(partition);
    match self.store.put(&name, key, &entry) {
      Ok(()) => Ok(()),
      Err(StoreError::QuotaExceeded) => {
        let swept = self.sweep_expired()?;
        debug!(swept, "cache quota hit, swept expired entries");
        match self.store.put(&name, key, &entry) {
          Ok(()) => Ok(()),
          Err(StoreError::QuotaExceeded) => {
            warn!(partition = partition.name(), key, "dropping cache write after quota sweep");
            Ok(())
          }
          Err(e) => Err(eyre!("Cache write failed for {}: {}", key, e)),
        }
      }
      Err(e) => Err(eyre!("Cache write failed for {}: {}", key, e)),
    }
  }

  #[allow(dead_code)]
  pub fn delete(&self, partition: Partition, key: &str) -> Result<()> {
    self
      .store
      .delete(&self.qualified_name(partition), key)
      .map_err(|e| eyre!("Cache delete failed for {}: {}", key, e))
  }

  /// Drop partitions from prior generations. Returns how many were removed.
  pub fn collect_garbage(&self) -> Result<usize> {
    self
      .store
      .delete_partitions_not_in(&self.keep_set())
      .map_err(|e| eyre!("Generation GC failed: {}", e))
  }

  /// Delete every partition, current generation included.
  pub fn purge_all(&self) -> Result<()> {
    self
      .store
      .purge_all()
      .map_err(|e| eyre!("Cache purge failed: {}", e))
  }

  /// Best-effort removal of expired entries across all declared partitions.
  fn sweep_expired(&self) -> Result<usize> {
    let now = Utc::now();
    let cutoffs: Vec<_> = Partition::ALL
      .iter()
      .map(|partition| (self.qualified_name(*partition), now - self.max_age(*partition)))
      .collect();

    self
      .store
      .sweep_expired(&cutoffs)
      .map_err(|e| eyre!("Expiry sweep failed: {}", e))
  }
}

impl<S: PartitionStore> Clone for PartitionCache<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      generation: self.generation.clone(),
      max_ages: self.max_ages.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;

  fn max_ages() -> BTreeMap<Partition, Duration> {
    let mut ages = BTreeMap::new();
    ages.insert(Partition::Static, Duration::days(7));
    ages.insert(Partition::Images, Duration::days(30));
    ages.insert(Partition::Api, Duration::minutes(5));
    ages.insert(Partition::Runtime, Duration::days(1));
    ages
  }

  fn cache() -> PartitionCache<MemoryStorage> {
    PartitionCache::new(MemoryStorage::new(), "v1", max_ages())
  }

  fn response(body: &[u8]) -> HttpResponse {
    HttpResponse {
      status: 200,
      headers: BTreeMap::new(),
      body: body.to_vec(),
    }
  }

  #[test]
  fn test_qualified_names() {
    let cache = cache();
    assert_eq!(cache.qualified_name(Partition::Api), "holdfast-v1-api");
    assert_eq!(cache.keep_set().len(), Partition::ALL.len());
  }

  #[test]
  fn test_fresh_entry_is_never_stale() {
    let cache = cache();
    cache.insert(Partition::Api, "/api/x", &response(b"{}")).unwrap();

    let entry = cache.get(Partition::Api, "/api/x").unwrap().unwrap();
    assert!(!cache.is_stale(&entry, Partition::Api));
  }

  #[test]
  fn test_staleness_boundary() {
    let cache = cache();
    let mut entry = CacheEntry {
      key: "/api/x".to_string(),
      status: 200,
      headers: BTreeMap::new(),
      body: Vec::new(),
      inserted_at: Utc::now() - Duration::minutes(6),
    };
    // Older than the api partition's five minutes.
    assert!(cache.is_stale(&entry, Partition::Api));
    // The same age is fine for the runtime partition's one day.
    assert!(!cache.is_stale(&entry, Partition::Runtime));

    entry.inserted_at = Utc::now() - Duration::minutes(4);
    assert!(!cache.is_stale(&entry, Partition::Api));
  }

  #[test]
  fn test_insert_stamps_fetched_at_header() {
    let cache = cache();
    cache.insert(Partition::Static, "/app.js", &response(b"js")).unwrap();

    let entry = cache.get(Partition::Static, "/app.js").unwrap().unwrap();
    assert!(entry.headers.contains_key(FETCHED_AT_HEADER));
  }

  #[test]
  fn test_quota_sweep_then_retry() {
    let store = MemoryStorage::with_entry_limit(1);
    let cache = PartitionCache::new(store, "v1", max_ages());

    // Seed an entry already past the api max age, then fill the quota check.
    let expired = CacheEntry {
      key: "/api/old".to_string(),
      status: 200,
      headers: BTreeMap::new(),
      body: b"old".to_vec(),
      inserted_at: Utc::now() - Duration::minutes(10),
    };
    cache
      .store
      .put(&cache.qualified_name(Partition::Api), "/api/old", &expired)
      .unwrap();

    // The write only fits after the sweep evicts the expired entry.
    cache.insert(Partition::Api, "/api/new", &response(b"new")).unwrap();
    assert!(cache.get(Partition::Api, "/api/new").unwrap().is_some());
    assert!(cache.get(Partition::Api, "/api/old").unwrap().is_none());
  }

  #[test]
  fn test_quota_exhausted_write_is_dropped() {
    let store = MemoryStorage::with_entry_limit(1);
    let cache = PartitionCache::new(store, "v1", max_ages());

    // A fresh entry the sweep will not remove.
    cache.insert(Partition::Static, "/app.js", &response(b"js")).unwrap();

    // No room and nothing expired: the write is silently dropped.
    cache.insert(Partition::Static, "/other.js", &response(b"x")).unwrap();
    assert!(cache.get(Partition::Static, "/other.js").unwrap().is_none());
    assert!(cache.get(Partition::Static, "/app.js").unwrap().is_some());
  }

  #[test]
  fn test_collect_garbage_drops_prior_generations() {
    let store = MemoryStorage::new();
    let old = PartitionCache::new(store, "v1", max_ages());
    old.insert(Partition::Static, "/app.js", &response(b"old")).unwrap();

    let new = old.with_generation("v2");
    new.insert(Partition::Static, "/app.js", &response(b"new")).unwrap();

    let removed = new.collect_garbage().unwrap();
    assert_eq!(removed, 1);
    assert!(old.get(Partition::Static, "/app.js").unwrap().is_none());
    assert_eq!(
      new.get(Partition::Static, "/app.js").unwrap().unwrap().body,
      b"new"
    );
  }
}
