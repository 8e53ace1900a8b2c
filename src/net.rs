//! HTTP request/response types and the network fetch seam.
//!
//! Everything the proxy knows about the network goes through the [`Fetcher`]
//! trait, so tests can substitute a scripted fetcher and the rest of the
//! crate never touches a socket directly.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// An intercepted outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
  pub method: String,
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
  /// Declared content kind of the request (document, image, script, ...),
  /// as reported by the host. Not all hosts set it.
  #[serde(default)]
  pub destination: Option<String>,
}

impl HttpRequest {
  /// Build a plain GET request, the shape used for pre-warming.
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
      destination: None,
    }
  }

  /// Safe methods never mutate origin state and are the only ones the cache
  /// will ever answer.
  pub fn is_safe(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET") || self.method.eq_ignore_ascii_case("HEAD")
  }

  /// Path component with query and fragment stripped, for rule matching.
  pub fn path(&self) -> &str {
    let raw = self.relative_part();
    raw
      .split(|c| c == '?' || c == '#')
      .next()
      .unwrap_or(raw)
  }

  /// Path plus query (fragment stripped), the key a response is cached under.
  pub fn cache_key(&self) -> &str {
    let raw = self.relative_part();
    raw.splitn(2, '#').next().unwrap_or(raw)
  }

  pub fn destination_is(&self, kind: &str) -> bool {
    self.destination.as_deref() == Some(kind)
  }

  /// The part of the URL after scheme and host, if any.
  fn relative_part(&self) -> &str {
    match self.url.find("://") {
      Some(scheme_end) => {
        let rest = &self.url[scheme_end + 3..];
        match rest.find('/') {
          Some(slash) => &rest[slash..],
          None => "/",
        }
      }
      None => &self.url,
    }
  }
}

/// The response handed back to the caller, whichever source produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Synthetic 503 returned when neither network nor cache can answer.
  pub fn service_unavailable() -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "text/plain".to_string());
    Self {
      status: 503,
      headers,
      body: b"service unavailable".to_vec(),
    }
  }

  /// Synthetic JSON 503 for API-classified requests.
  pub fn api_unavailable() -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      status: 503,
      headers,
      body: br#"{"error":"offline"}"#.to_vec(),
    }
  }

  /// Synthetic 503 acknowledging a mutation parked in the durable queue.
  pub fn mutation_queued() -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      status: 503,
      headers,
      body: br#"{"error":"offline","queued":true}"#.to_vec(),
    }
  }
}

/// Why a fetch produced no response at all. A response with a non-2xx status
/// is not a `FetchError`; it reached the origin.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("request timed out")]
  Timeout,
  #[error("could not reach origin: {0}")]
  Connect(String),
  #[error("invalid request url: {0}")]
  BadUrl(String),
  #[error("transport error: {0}")]
  Transport(String),
}

/// Network seam. The proxy never fetches except through this.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// Production fetcher: reqwest with a bounded per-request timeout, resolving
/// relative URLs against the configured origin.
pub struct ReqwestFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl ReqwestFetcher {
  pub fn new(origin: &str, timeout: Duration) -> Result<Self> {
    let origin =
      Url::parse(origin).map_err(|e| eyre!("Invalid origin url {}: {}", origin, e))?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build http client: {}", e))?;

    Ok(Self { client, origin })
  }

  fn absolute(&self, url: &str) -> Result<Url, FetchError> {
    if url.starts_with("http://") || url.starts_with("https://") {
      Url::parse(url).map_err(|e| FetchError::BadUrl(e.to_string()))
    } else {
      self
        .origin
        .join(url)
        .map_err(|e| FetchError::BadUrl(e.to_string()))
    }
  }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
    let url = self.absolute(&request.url)?;
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::BadUrl(e.to_string()))?;

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout
      } else if e.is_connect() {
        FetchError::Connect(e.to_string())
      } else {
        FetchError::Transport(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        headers.insert(name.as_str().to_string(), value.to_string());
      }
    }
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Transport(e.to_string()))?
      .to_vec();

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

/// Scripted fetcher for unit tests.
#[cfg(test)]
pub mod testing {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Pops pre-scripted outcomes in order and counts calls. An exhausted
  /// script behaves like an unreachable origin.
  #[derive(Default)]
  pub struct MockFetcher {
    script: Mutex<VecDeque<Result<HttpResponse, FetchError>>>,
    calls: AtomicUsize,
  }

  impl MockFetcher {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn push_ok(&self, status: u16, body: &[u8]) {
      self
        .script
        .lock()
        .unwrap()
        .push_back(Ok(HttpResponse {
          status,
          headers: BTreeMap::new(),
          body: body.to_vec(),
        }));
    }

    pub fn push_err(&self, error: FetchError) {
      self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Fetcher for MockFetcher {
    async fn fetch(&self, _request: &HttpRequest) -> Result<HttpResponse, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(FetchError::Connect("no scripted response".to_string())))
    }
  }
}
