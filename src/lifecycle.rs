//! Install-time pre-warming and activation-time garbage collection.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{PartitionCache, PartitionStore};
use crate::classify::Partition;
use crate::net::{Fetcher, HttpRequest};

/// Lifecycle phases. A proxy that fails installation stays in `Installing`
/// and is superseded by the next deployed generation; there is no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Installing,
  Installed,
  Activating,
  Active,
}

/// Result of pre-warming the critical asset list. The pre-warm is
/// all-or-nothing as a report: any failed asset marks it incomplete.
#[derive(Debug, Clone)]
pub struct InstallReport {
  pub prewarmed: usize,
  pub failed: Vec<String>,
}

impl InstallReport {
  pub fn complete(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Fetch each asset and store it in the static partition.
///
/// Fetch failures are collected into the report; a store-level failure is an
/// error, since a proxy that cannot seed its cache has not installed.
pub async fn prewarm<S: PartitionStore>(
  cache: &PartitionCache<S>,
  fetcher: &dyn Fetcher,
  assets: &[String],
) -> Result<InstallReport> {
  let mut report = InstallReport {
    prewarmed: 0,
    failed: Vec::new(),
  };

  for url in assets {
    let request = HttpRequest::get(url.clone());
    match fetcher.fetch(&request).await {
      Ok(response) if response.is_success() => {
        cache.insert(Partition::Static, request.cache_key(), &response)?;
        report.prewarmed += 1;
      }
      Ok(response) => {
        warn!(url = url.as_str(), status = response.status, "pre-warm fetch rejected");
        report.failed.push(url.clone());
      }
      Err(error) => {
        warn!(url = url.as_str(), %error, "pre-warm fetch failed");
        report.failed.push(url.clone());
      }
    }
  }

  Ok(report)
}

/// Drives the proxy through install and activate, and owns the claim flag
/// that tells the request path whether to intercept.
pub struct Lifecycle<S: PartitionStore> {
  phase: Phase,
  cache: PartitionCache<S>,
  claimed: Arc<AtomicBool>,
}

impl<S: PartitionStore> Lifecycle<S> {
  pub fn new(cache: PartitionCache<S>) -> Self {
    Self {
      phase: Phase::Installing,
      cache,
      claimed: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  /// Shared flag the fetch path reads: until activation claims open
  /// sessions, traffic flows to the network untouched.
  pub fn interception_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.claimed)
  }

  /// Pre-warm the critical asset list. An incomplete pre-warm is reported
  /// but the proxy still becomes `Installed`; only a store failure leaves it
  /// stuck in `Installing`.
  pub async fn install(&mut self, fetcher: &dyn Fetcher, assets: &[String]) -> Result<InstallReport> {
    let report = prewarm(&self.cache, fetcher, assets).await?;
    if report.complete() {
      info!(prewarmed = report.prewarmed, "install pre-warm complete");
    } else {
      warn!(
        prewarmed = report.prewarmed,
        failed = report.failed.len(),
        "install pre-warm incomplete"
      );
    }
    self.phase = Phase::Installed;
    Ok(report)
  }

  /// Garbage collect partitions from prior generations, then claim all open
  /// sessions so even pages opened before this proxy existed are served.
  /// Returns the number of partitions removed.
  pub fn activate(&mut self) -> Result<usize> {
    self.phase = Phase::Activating;
    let removed = self.cache.collect_garbage()?;
    self.phase = Phase::Active;
    self.claimed.store(true, Ordering::SeqCst);
    info!(removed, generation = self.cache.generation(), "activated");
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::net::testing::MockFetcher;
  use crate::net::FetchError;
  use chrono::Duration;
  use std::collections::BTreeMap;

  fn max_ages() -> BTreeMap<Partition, Duration> {
    Partition::ALL
      .iter()
      .map(|p| (*p, Duration::days(1)))
      .collect()
  }

  fn cache() -> PartitionCache<MemoryStorage> {
    PartitionCache::new(MemoryStorage::new(), "v2", max_ages())
  }

  #[tokio::test]
  async fn test_install_prewarms_shell_and_advances() {
    let cache = cache();
    let mut lifecycle = Lifecycle::new(cache.clone());
    assert_eq!(lifecycle.phase(), Phase::Installing);

    let fetcher = MockFetcher::new();
    fetcher.push_ok(200, b"<html>shell</html>");
    fetcher.push_ok(200, b"console.log(1)");

    let assets = vec!["/".to_string(), "/assets/app.js".to_string()];
    let report = lifecycle.install(&fetcher, &assets).await.unwrap();

    assert!(report.complete());
    assert_eq!(report.prewarmed, 2);
    assert_eq!(lifecycle.phase(), Phase::Installed);
    assert!(cache.get(Partition::Static, "/").unwrap().is_some());
    assert!(cache.get(Partition::Static, "/assets/app.js").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_failed_prewarm_is_reported_but_installs() {
    let mut lifecycle = Lifecycle::new(cache());

    let fetcher = MockFetcher::new();
    fetcher.push_ok(200, b"shell");
    fetcher.push_err(FetchError::Timeout);

    let assets = vec!["/".to_string(), "/assets/app.js".to_string()];
    let report = lifecycle.install(&fetcher, &assets).await.unwrap();

    assert!(!report.complete());
    assert_eq!(report.failed, vec!["/assets/app.js".to_string()]);
    // Best effort: the proxy still proceeds to Installed.
    assert_eq!(lifecycle.phase(), Phase::Installed);
  }

  #[tokio::test]
  async fn test_activation_collects_prior_generations() {
    let store = MemoryStorage::new();
    let old = PartitionCache::new(store, "v1", max_ages());
    old
      .insert(
        Partition::Static,
        "/app.js",
        &crate::net::HttpResponse {
          status: 200,
          headers: BTreeMap::new(),
          body: b"old".to_vec(),
        },
      )
      .unwrap();

    let new = old.with_generation("v2");
    let mut lifecycle = Lifecycle::new(new.clone());

    let removed = lifecycle.activate().unwrap();
    assert_eq!(removed, 1);
    assert_eq!(lifecycle.phase(), Phase::Active);
    assert!(old.get(Partition::Static, "/app.js").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_claim_flag_flips_on_activation() {
    let mut lifecycle = Lifecycle::new(cache());
    let flag = lifecycle.interception_flag();
    assert!(!flag.load(Ordering::SeqCst));

    lifecycle.activate().unwrap();
    assert!(flag.load(Ordering::SeqCst));
  }
}
