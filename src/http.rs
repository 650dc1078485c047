//! Transport-independent request and response types.
//!
//! Cache identity is `(method, normalized URL)`: fragments are stripped at
//! construction and the `url` crate canonicalizes case and default ports, so
//! two spellings of the same resource share one cache entry.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use url::Url;

/// HTTP methods this layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Canonical upper-case name, used for cache keys and queue persistence.
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Parse a persisted method name.
  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(eyre!("Unknown HTTP method: {}", other)),
    }
  }

  /// Whether this method writes server state and must bypass the read cache.
  pub fn is_mutation(&self) -> bool {
    matches!(self, Method::Post | Method::Put | Method::Patch | Method::Delete)
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An outbound request as seen by the interception layer and the queue.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl HttpRequest {
  /// Create a request; the URL fragment is dropped because it never reaches
  /// the server and must not split cache identity.
  pub fn new(method: Method, mut url: Url) -> Self {
    url.set_fragment(None);
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn post(url: Url, body: Vec<u8>) -> Self {
    Self::new(Method::Post, url).with_body(body)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// First header with the given name, compared case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Stable cache identity: `"<METHOD> <normalized url>"`.
  pub fn cache_key(&self) -> String {
    format!("{} {}", self.method.as_str(), self.url)
  }
}

/// A response as stored in and served from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  /// 2xx statuses count as success; everything else is passed through uncached.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header with the given name, compared case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace the header if present, append otherwise.
  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    let value = value.into();
    match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
      Some((_, v)) => *v = value,
      None => self.headers.push((name.to_string(), value)),
    }
  }
}

/// A cached response together with the moment it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub response: HttpResponse,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(response: HttpResponse, stored_at: DateTime<Utc>) -> Self {
    Self { response, stored_at }
  }

  /// An entry is fresh until its bucket TTL elapses; buckets without a TTL
  /// never go stale.
  pub fn is_fresh(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    match ttl {
      Some(ttl) => now - self.stored_at <= ttl,
      None => true,
    }
  }
}
