//! Fetch router that orchestrates caching strategies over the transport.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::classify::{Action, Classifier};
use crate::http::{CacheEntry, HttpRequest, HttpResponse};
use crate::store::CacheStore;
use crate::transport::Transport;

/// Header stamped onto every response cached by the router, carrying the
/// RFC 3339 fetch time so consumers can display data age.
pub const FETCHED_AT_HEADER: &str = "x-fetched-at";

/// Result of a routed fetch, including where the response came from.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub response: HttpResponse,
  pub source: ResponseSource,
  /// When the served entry was cached (absent for live responses)
  pub stored_at: Option<DateTime<Utc>>,
}

impl FetchOutcome {
  /// A live response straight from the network.
  fn from_network(response: HttpResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      stored_at: None,
    }
  }

  /// A response served out of a cache bucket.
  fn from_cache(entry: CacheEntry, is_stale: bool) -> Self {
    Self {
      source: if is_stale {
        ResponseSource::CacheStale
      } else {
        ResponseSource::CacheFresh
      },
      stored_at: Some(entry.stored_at),
      response: entry.response,
    }
  }

  /// A synthetic reply standing in for an unreachable upstream.
  fn offline(response: HttpResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Offline,
      stored_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live response from the network
  Network,
  /// Cached response within its freshness window
  CacheFresh,
  /// Cached response past its freshness window, served because the
  /// network attempt failed
  CacheStale,
  /// Synthetic reply; nothing cached and the network unavailable
  Offline,
}

/// Routes read requests through the caching strategy their class picks.
///
/// Sits between the application and the transport:
/// 1. Classify the URL
/// 2. Network-first (pages, API), cache-first (assets, images), or
///    network-only (external origins)
/// 3. Never surface a raw transport error; callers always get a response
pub struct FetchRouter<S: CacheStore, T: Transport> {
  store: Arc<S>,
  transport: Arc<T>,
  classifier: Classifier,
  /// Upper bound on a single network attempt
  fetch_timeout: Duration,
}

impl<S: CacheStore, T: Transport> FetchRouter<S, T> {
  pub fn new(
    store: Arc<S>,
    transport: Arc<T>,
    classifier: Classifier,
    fetch_timeout: Duration,
  ) -> Self {
    Self {
      store,
      transport,
      classifier,
      fetch_timeout,
    }
  }

  /// Serve one read request. Mutating methods are refused; they belong on
  /// the mutation queue, not the cache.
  pub async fn dispatch(&self, request: &HttpRequest) -> Result<FetchOutcome> {
    if request.method.is_mutation() {
      return Err(eyre!(
        "Refusing to route {} {} through the cache; mutations go through the queue",
        request.method,
        request.url
      ));
    }

    match self.classifier.classify(&request.url).action() {
      Action::NetworkFirst { bucket } => self.network_first(request, bucket).await,
      Action::CacheFirst { bucket } => self.cache_first(request, bucket).await,
      Action::NetworkOnly => self.network_only(request).await,
    }
  }

  /// Network-first: live data when reachable, within-TTL cache otherwise.
  ///
  /// 1. Attempt the network under the fetch timeout
  /// 2. On 2xx, stamp the fetch time and write through to the bucket
  /// 3. On transport failure, serve the cached entry only if still fresh
  /// 4. Expired or absent means a synthetic offline reply, never stale data
  async fn network_first(&self, request: &HttpRequest, bucket: &str) -> Result<FetchOutcome> {
    match self.try_network(request).await {
      Ok(response) if response.is_success() => {
        let entry = self.stamp_and_store(request, bucket, response)?;
        Ok(FetchOutcome::from_network(entry.response))
      }
      // Upstream answered with an error; pass it through uncached
      Ok(response) => Ok(FetchOutcome::from_network(response)),
      Err(err) => {
        debug!(url = %request.url, error = %err, "network-first fetch failed, consulting cache");

        let ttl = self.store.bucket_ttl(bucket);
        match self.store.read(bucket, &request.cache_key())? {
          Some(entry) if entry.is_fresh(ttl, Utc::now()) => {
            Ok(FetchOutcome::from_cache(entry, false))
          }
          _ => Ok(FetchOutcome::offline(offline_reply(&request.url))),
        }
      }
    }
  }

  /// Cache-first: cached data when fresh, network otherwise, stale data as
  /// the last resort before a synthetic reply.
  async fn cache_first(&self, request: &HttpRequest, bucket: &str) -> Result<FetchOutcome> {
    let key = request.cache_key();
    let ttl = self.store.bucket_ttl(bucket);
    let cached = self.store.read(bucket, &key)?;

    if let Some(entry) = &cached {
      if entry.is_fresh(ttl, Utc::now()) {
        return Ok(FetchOutcome::from_cache(entry.clone(), false));
      }
    }

    match self.try_network(request).await {
      Ok(response) if response.is_success() => {
        let entry = self.stamp_and_store(request, bucket, response)?;
        Ok(FetchOutcome::from_network(entry.response))
      }
      Ok(response) => Ok(FetchOutcome::from_network(response)),
      Err(err) => match cached {
        Some(entry) => {
          debug!(url = %request.url, error = %err, "network unavailable, serving stale entry");
          Ok(FetchOutcome::from_cache(entry, true))
        }
        None => Ok(FetchOutcome::offline(offline_reply(&request.url))),
      },
    }
  }

  /// Network-only: external origins never touch the buckets. Transport
  /// failures still come back as a tagged synthetic response.
  async fn network_only(&self, request: &HttpRequest) -> Result<FetchOutcome> {
    match self.try_network(request).await {
      Ok(response) => Ok(FetchOutcome::from_network(response)),
      Err(err) => {
        warn!(url = %request.url, error = %err, "external fetch failed");
        Ok(FetchOutcome::offline(unavailable_reply(&request.url)))
      }
    }
  }

  async fn try_network(&self, request: &HttpRequest) -> Result<HttpResponse> {
    match tokio::time::timeout(self.fetch_timeout, self.transport.send(request)).await {
      Ok(result) => result,
      Err(_) => Err(eyre!(
        "Request to {} timed out after {:?}",
        request.url,
        self.fetch_timeout
      )),
    }
  }

  fn stamp_and_store(
    &self,
    request: &HttpRequest,
    bucket: &str,
    mut response: HttpResponse,
  ) -> Result<CacheEntry> {
    let now = Utc::now();
    response.set_header(FETCHED_AT_HEADER, now.to_rfc3339());

    let entry = CacheEntry::new(response, now);
    self.store.write(bucket, &request.cache_key(), &entry)?;

    Ok(entry)
  }
}

fn offline_reply(url: &Url) -> HttpResponse {
  synthetic_503("offline", url)
}

fn unavailable_reply(url: &Url) -> HttpResponse {
  synthetic_503("upstream_unavailable", url)
}

/// Synthetic 503 served in place of a raw transport error.
fn synthetic_503(reason: &str, url: &Url) -> HttpResponse {
  let body = serde_json::json!({ "error": reason, "url": url.as_str() });

  HttpResponse::new(503)
    .with_header("content-type", "application/json")
    .with_body(body.to_string().into_bytes())
}
