//! Outbound HTTP transport behind a trait seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::http::{HttpRequest, HttpResponse, Method};

/// Trait for sending requests upstream.
///
/// An `Err` means the transport itself failed (unreachable host, refused
/// connection, timeout). A served response with a non-2xx status is not a
/// transport error.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport shared by the interception layer and the sync
/// coordinator.
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::Mutex;

  type Handler = Box<dyn FnOnce(&HttpRequest) -> Result<HttpResponse> + Send>;

  /// Scripted transport for tests. Pushed handlers are consumed in order;
  /// once the script runs out, every request gets the default outcome the
  /// fake was constructed with. Records each request it sees.
  pub(crate) struct FakeTransport {
    handlers: Mutex<VecDeque<Handler>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
    default: fn(&HttpRequest) -> Result<HttpResponse>,
  }

  impl FakeTransport {
    /// Defaults every unscripted request to 200 "ok".
    pub(crate) fn ok() -> Self {
      Self::with_default(|_| Ok(HttpResponse::new(200).with_body(b"ok".to_vec())))
    }

    /// Defaults every unscripted request to a transport failure.
    pub(crate) fn failing() -> Self {
      Self::with_default(|request| Err(eyre!("connection refused: {}", request.url)))
    }

    fn with_default(default: fn(&HttpRequest) -> Result<HttpResponse>) -> Self {
      Self {
        handlers: Mutex::new(VecDeque::new()),
        requests: Mutex::new(Vec::new()),
        delay: None,
        default,
      }
    }

    /// Add artificial latency to every send.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = Some(delay);
      self
    }

    /// Script the outcome for the next unclaimed request.
    pub(crate) fn push<F>(&self, handler: F)
    where
      F: FnOnce(&HttpRequest) -> Result<HttpResponse> + Send + 'static,
    {
      self.handlers.lock().unwrap().push_back(Box::new(handler));
    }

    /// Every request sent through this transport, in order.
    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
      self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
      self.requests.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl Transport for FakeTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }

      self.requests.lock().unwrap().push(request.clone());

      let handler = self.handlers.lock().unwrap().pop_front();
      match handler {
        Some(handler) => handler(request),
        None => (self.default)(request),
      }
    }
  }
}
