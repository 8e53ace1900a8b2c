//! Request classification: which partition and fetch strategy a request gets.
//!
//! The rule table is ordered and first match wins. The exclusion list is
//! checked before any rule so server-internal paths are never intercepted.

use crate::net::HttpRequest;

/// Cache partitions. A closed set known at process start, so an unknown
/// partition name is unrepresentable rather than a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Partition {
  /// Long-lived application shell assets (scripts, styles, fonts).
  Static,
  Images,
  /// API responses, short-lived.
  Api,
  /// Navigable documents and everything unclassified.
  Runtime,
}

impl Partition {
  pub const ALL: [Partition; 4] = [
    Partition::Static,
    Partition::Images,
    Partition::Api,
    Partition::Runtime,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Partition::Static => "static",
      Partition::Images => "images",
      Partition::Api => "api",
      Partition::Runtime => "runtime",
    }
  }
}

/// Read policy applied to a classified request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
}

/// Where a request is routed after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Never intercepted; forwarded to the origin untouched.
  Passthrough,
  Cached {
    partition: Partition,
    strategy: Strategy,
  },
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "svg", "ico"];
const STATIC_EXTENSIONS: &[&str] = &["js", "css", "woff", "woff2"];

enum Matcher {
  Extension(&'static [&'static str]),
  PathPrefix(String),
  Destination(&'static str),
}

struct Rule {
  matcher: Matcher,
  partition: Partition,
  strategy: Strategy,
}

impl Rule {
  fn matches(&self, request: &HttpRequest) -> bool {
    match &self.matcher {
      Matcher::Extension(extensions) => {
        let path = request.path();
        let file = path.rsplit('/').next().unwrap_or(path);
        match file.rsplit_once('.') {
          Some((_, ext)) => extensions.contains(&ext.to_ascii_lowercase().as_str()),
          None => false,
        }
      }
      Matcher::PathPrefix(prefix) => request.path().starts_with(prefix.as_str()),
      Matcher::Destination(kind) => request.destination_is(kind),
    }
  }
}

/// Classifies requests against the exclusion list and the ordered rule table.
pub struct Classifier {
  exclusions: Vec<String>,
  rules: Vec<Rule>,
}

impl Classifier {
  pub fn new(exclusions: Vec<String>, asset_prefix: String, api_prefix: String) -> Self {
    let rules = vec![
      Rule {
        matcher: Matcher::Extension(IMAGE_EXTENSIONS),
        partition: Partition::Images,
        strategy: Strategy::CacheFirst,
      },
      Rule {
        matcher: Matcher::Destination("image"),
        partition: Partition::Images,
        strategy: Strategy::CacheFirst,
      },
      Rule {
        matcher: Matcher::Extension(STATIC_EXTENSIONS),
        partition: Partition::Static,
        strategy: Strategy::CacheFirst,
      },
      Rule {
        matcher: Matcher::PathPrefix(asset_prefix),
        partition: Partition::Static,
        strategy: Strategy::CacheFirst,
      },
      Rule {
        matcher: Matcher::PathPrefix(api_prefix),
        partition: Partition::Api,
        strategy: Strategy::NetworkFirst,
      },
      Rule {
        matcher: Matcher::Destination("document"),
        partition: Partition::Runtime,
        strategy: Strategy::NetworkFirst,
      },
    ];

    Self { exclusions, rules }
  }

  /// Classify a request. No rule matching is a recoverable condition: the
  /// default is the runtime partition under network-first.
  pub fn classify(&self, request: &HttpRequest) -> Route {
    // Exclusions win over every rule.
    let key = request.cache_key();
    if self.exclusions.iter().any(|marker| key.contains(marker.as_str())) {
      return Route::Passthrough;
    }

    for rule in &self.rules {
      if rule.matches(request) {
        return Route::Cached {
          partition: rule.partition,
          strategy: rule.strategy,
        };
      }
    }

    Route::Cached {
      partition: Partition::Runtime,
      strategy: Strategy::NetworkFirst,
    }
  }
}
