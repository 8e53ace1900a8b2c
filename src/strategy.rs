//! Fetch strategies: how a classified request is answered from cache and
//! network.
//!
//! Callers always get a well-formed response. Network and store failures are
//! absorbed here and degrade along the fallback chain, ending in a synthetic
//! 503 when nothing better exists.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, PartitionCache, PartitionStore};
use crate::classify::{Classifier, Partition, Route, Strategy};
use crate::net::{Fetcher, HttpRequest, HttpResponse};

/// Executes the fetch strategy selected by classification.
pub struct StrategyRouter<S: PartitionStore> {
  cache: PartitionCache<S>,
  classifier: Arc<Classifier>,
  fetcher: Arc<dyn Fetcher>,
  /// Key of the pre-cached root document, the last resort for navigations.
  root_document: String,
}

impl<S: PartitionStore> StrategyRouter<S> {
  pub fn new(
    cache: PartitionCache<S>,
    classifier: Classifier,
    fetcher: Arc<dyn Fetcher>,
    root_document: String,
  ) -> Self {
    Self {
      cache,
      classifier: Arc::new(classifier),
      fetcher,
      root_document,
    }
  }

  /// Answer a safe (read-only) request.
  pub async fn handle(&self, request: &HttpRequest) -> HttpResponse {
    match self.classifier.classify(request) {
      Route::Passthrough => self.passthrough(request).await,
      Route::Cached {
        partition,
        strategy,
      } => match strategy {
        Strategy::CacheFirst => self.cache_first(partition, request).await,
        Strategy::NetworkFirst => self.network_first(partition, request).await,
      },
    }
  }

  /// Forward to the origin with no caching involvement.
  pub async fn passthrough(&self, request: &HttpRequest) -> HttpResponse {
    match self.fetcher.fetch(request).await {
      Ok(response) => response,
      Err(error) => {
        warn!(%error, url = %request.url, "passthrough fetch failed");
        HttpResponse::service_unavailable()
      }
    }
  }

  /// Serve a fresh cached entry without touching the network; otherwise
  /// fetch, store on success, and fall back to a stale entry on failure.
  async fn cache_first(&self, partition: Partition, request: &HttpRequest) -> HttpResponse {
    let key = request.cache_key().to_string();

    let cached = self.lookup(partition, &key);
    if let Some(entry) = &cached {
      if !self.cache.is_stale(entry, partition) {
        return entry_response(entry);
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_success(partition, &key, &response);
        response
      }
      Err(error) => {
        debug!(%error, key, "cache-first fetch failed");
        match cached {
          // Stale beats nothing when the network is gone.
          Some(entry) => entry_response(&entry),
          None => HttpResponse::service_unavailable(),
        }
      }
    }
  }

  /// Fetch first; on network failure fall back to cache, then to the
  /// pre-cached root document for navigations, then to a synthetic 503.
  async fn network_first(&self, partition: Partition, request: &HttpRequest) -> HttpResponse {
    let key = request.cache_key().to_string();

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_success(partition, &key, &response);
        response
      }
      Err(error) => {
        debug!(%error, key, "network-first fetch failed, checking cache");
        if let Some(entry) = self.lookup(partition, &key) {
          return entry_response(&entry);
        }
        if request.destination_is("document") {
          if let Some(entry) = self.lookup(Partition::Static, &self.root_document) {
            return entry_response(&entry);
          }
          return HttpResponse::service_unavailable();
        }
        if partition == Partition::Api {
          return HttpResponse::api_unavailable();
        }
        HttpResponse::service_unavailable()
      }
    }
  }

  /// Store a successful response before it is returned, so a concurrent
  /// identical request can observe the fresh entry. Error responses are
  /// never cached, and a failed write never fails the response.
  fn store_success(&self, partition: Partition, key: &str, response: &HttpResponse) {
    if !response.is_success() {
      return;
    }
    if let Err(error) = self.cache.insert(partition, key, response) {
      warn!(%error, key, "failed to cache response");
    }
  }

  fn lookup(&self, partition: Partition, key: &str) -> Option<CacheEntry> {
    match self.cache.get(partition, key) {
      Ok(entry) => entry,
      Err(error) => {
        warn!(%error, key, "cache lookup failed");
        None
      }
    }
  }
}

impl<S: PartitionStore> Clone for StrategyRouter<S> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      classifier: Arc::clone(&self.classifier),
      fetcher: Arc::clone(&self.fetcher),
      root_document: self.root_document.clone(),
    }
  }
}

/// Rebuild a response from a stored entry, headers included. The synthetic
/// insertion-time header rides along; consumers ignore it.
fn entry_response(entry: &CacheEntry) -> HttpResponse {
  HttpResponse {
    status: entry.status,
    headers: entry.headers.clone(),
    body: entry.body.clone(),
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
    let mut ages = BTreeMap::new();
    ages.insert(Partition::Static, Duration::days(7));
    ages.insert(Partition::Images, Duration::days(30));
    ages.insert(Partition::Api, Duration::minutes(5));
    ages.insert(Partition::Runtime, Duration::days(1));
    ages
  }

  fn router_with_ages(
    fetcher: Arc<MockFetcher>,
    ages: BTreeMap<Partition, Duration>,
  ) -> StrategyRouter<MemoryStorage> {
    let cache = PartitionCache::new(MemoryStorage::new(), "v1", ages);
    let classifier = Classifier::new(
      vec!["/server/".to_string()],
      "/assets/".to_string(),
      "/api/".to_string(),
    );
    StrategyRouter::new(cache, classifier, fetcher, "/".to_string())
  }

  fn router(fetcher: Arc<MockFetcher>) -> StrategyRouter<MemoryStorage> {
    router_with_ages(fetcher, max_ages())
  }

  #[tokio::test]
  async fn test_cache_first_round_trip_then_zero_network() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(200, b"console.log(1)");
    let router = router(Arc::clone(&fetcher));
    let request = HttpRequest::get("/assets/app.js");

    let first = router.handle(&request).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"console.log(1)");
    assert_eq!(fetcher.calls(), 1);

    // Fresh hit: same body, no second fetch.
    let second = router.handle(&request).await;
    assert_eq!(second.body, b"console.log(1)");
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_falls_back_to_stale_entry() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(200, b"v1");
    // Zero max age: every stored image is immediately stale.
    let mut ages = max_ages();
    ages.insert(Partition::Images, Duration::zero());
    let router = router_with_ages(Arc::clone(&fetcher), ages);
    let request = HttpRequest::get("/logo.png");

    router.handle(&request).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    // The refresh attempt fails; the stale entry is still served.
    fetcher.push_err(FetchError::Timeout);
    let response = router.handle(&request).await;
    assert_eq!(response.body, b"v1");
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_cache_first_miss_and_no_network_is_503() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_err(FetchError::Connect("down".to_string()));
    let router = router(fetcher);

    let response = router.handle(&HttpRequest::get("/logo.png")).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_error_responses_are_returned_but_not_cached() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(404, b"not found");
    let router = router(Arc::clone(&fetcher));
    let request = HttpRequest::get("/assets/app.js");

    let response = router.handle(&request).await;
    assert_eq!(response.status, 404);
    assert!(router
      .cache
      .get(Partition::Static, "/assets/app.js")
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_network_first_prefers_network() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(200, br#"{"page":1}"#);
    fetcher.push_ok(200, br#"{"page":2}"#);
    let router = router(Arc::clone(&fetcher));
    let request = HttpRequest::get("/api/listings");

    router.handle(&request).await;
    let second = router.handle(&request).await;
    // Cached entry exists but network-first refetches every time.
    assert_eq!(second.body, br#"{"page":2}"#);
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_network_first_failure_returns_cached_body_exactly() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(200, br#"{"listings":[1,2]}"#);
    fetcher.push_err(FetchError::Timeout);
    let router = router(Arc::clone(&fetcher));
    let request = HttpRequest::get("/api/listings");

    router.handle(&request).await;
    let offline = router.handle(&request).await;
    assert_eq!(offline.status, 200);
    assert_eq!(offline.body, br#"{"listings":[1,2]}"#);
  }

  #[tokio::test]
  async fn test_network_first_api_miss_is_json_503() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_err(FetchError::Connect("down".to_string()));
    let router = router(fetcher);

    let response = router.handle(&HttpRequest::get("/api/listings")).await;
    assert_eq!(response.status, 503);
    assert_eq!(
      response.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
  }

  #[tokio::test]
  async fn test_document_falls_back_to_root_shell() {
    let fetcher = Arc::new(MockFetcher::new());
    let router = router(Arc::clone(&fetcher));

    // The shell the install phase would have pre-cached.
    router
      .cache
      .insert(
        Partition::Static,
        "/",
        &HttpResponse {
          status: 200,
          headers: BTreeMap::new(),
          body: b"<html>shell</html>".to_vec(),
        },
      )
      .unwrap();

    fetcher.push_err(FetchError::Connect("down".to_string()));
    let mut request = HttpRequest::get("/listings/42");
    request.destination = Some("document".to_string());

    let response = router.handle(&request).await;
    assert_eq!(response.body, b"<html>shell</html>");
  }

  #[tokio::test]
  async fn test_excluded_path_is_never_cached() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(200, b"server impl");
    let router = router(Arc::clone(&fetcher));

    let response = router.handle(&HttpRequest::get("/server/impl.js")).await;
    assert_eq!(response.status, 200);
    assert_eq!(fetcher.calls(), 1);
    for partition in Partition::ALL {
      assert!(router.cache.get(partition, "/server/impl.js").unwrap().is_none());
    }
  }
}
