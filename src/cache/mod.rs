//! Partitioned response cache with per-partition staleness policies.
//!
//! This module provides the durable half of the proxy:
//! - Named partitions qualified by generation, so an upgrade can garbage
//!   collect everything a prior build left behind
//! - Staleness computed from each partition's max age
//! - Quota recovery (sweep expired, retry once, then drop the write)

mod layer;
mod storage;
mod traits;

pub use layer::PartitionCache;
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheEntry, PartitionStore, StoreError, FETCHED_AT_HEADER};
