//! Request classification and strategy selection.

use url::Url;

use crate::config::RouteRules;

/// Coarse class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Same-origin fingerprinted asset (scripts, styles, fonts)
  StaticAsset,
  /// Same-origin navigation / document request
  HtmlPage,
  /// Same-origin API call
  Api,
  /// Same-origin image
  Image,
  /// Anything on a different origin
  ExternalOrigin,
}

/// What the router should do for a class: which strategy, which bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  /// Try the network, fall back to a within-TTL cached entry
  NetworkFirst { bucket: &'static str },
  /// Serve a fresh cached entry immediately, otherwise fetch;
  /// a stale entry is still served if the fetch fails
  CacheFirst { bucket: &'static str },
  /// Never read or write any bucket
  NetworkOnly,
}

impl RequestClass {
  pub fn action(&self) -> Action {
    match self {
      RequestClass::Api => Action::NetworkFirst { bucket: "api" },
      RequestClass::HtmlPage => Action::NetworkFirst { bucket: "runtime" },
      RequestClass::StaticAsset => Action::CacheFirst { bucket: "static" },
      RequestClass::Image => Action::CacheFirst { bucket: "image" },
      RequestClass::ExternalOrigin => Action::NetworkOnly,
    }
  }
}

/// Classifies request URLs against the application origin and route rules.
///
/// Classification is a pure function of the URL: cross-origin requests are
/// `ExternalOrigin`; same-origin paths match API prefixes first, then image
/// extensions, then static extensions, and default to `HtmlPage`.
pub struct Classifier {
  origin: Url,
  rules: RouteRules,
}

impl Classifier {
  pub fn new(origin: Url, rules: RouteRules) -> Self {
    Self { origin, rules }
  }

  pub fn classify(&self, url: &Url) -> RequestClass {
    if url.origin() != self.origin.origin() {
      return RequestClass::ExternalOrigin;
    }

    let path = url.path();
    if self
      .rules
      .api_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return RequestClass::Api;
    }

    match extension(path) {
      Some(ext) if matches_extension(&self.rules.image_extensions, ext) => RequestClass::Image,
      Some(ext) if matches_extension(&self.rules.static_extensions, ext) => {
        RequestClass::StaticAsset
      }
      _ => RequestClass::HtmlPage,
    }
  }
}

fn extension(path: &str) -> Option<&str> {
  let file = path.rsplit('/').next()?;
  let (_, ext) = file.rsplit_once('.')?;
  if ext.is_empty() {
    None
  } else {
    Some(ext)
  }
}

fn matches_extension(extensions: &[String], ext: &str) -> bool {
  extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    Classifier::new(
      Url::parse("https://app.example.com").unwrap(),
      RouteRules::default(),
    )
  }

  fn classify(url: &str) -> RequestClass {
    classifier().classify(&Url::parse(url).unwrap())
  }

  #[test]
  fn test_cross_origin_is_external() {
    assert_eq!(
      classify("https://cdn.other.com/lib.js"),
      RequestClass::ExternalOrigin
    );
    assert_eq!(
      classify("http://app.example.com/page"),
      RequestClass::ExternalOrigin
    );
    assert_eq!(
      classify("https://app.example.com:8443/page"),
      RequestClass::ExternalOrigin
    );
  }

  #[test]
  fn test_default_port_is_same_origin() {
    assert_eq!(
      classify("https://app.example.com:443/api/tasks"),
      RequestClass::Api
    );
  }

  #[test]
  fn test_api_prefix_wins_over_extension() {
    assert_eq!(classify("https://app.example.com/api/tasks"), RequestClass::Api);
    // Prefix match applies even to paths that look like assets
    assert_eq!(
      classify("https://app.example.com/api/export.js"),
      RequestClass::Api
    );
  }

  #[test]
  fn test_asset_extensions() {
    assert_eq!(
      classify("https://app.example.com/assets/app.min.js"),
      RequestClass::StaticAsset
    );
    assert_eq!(
      classify("https://app.example.com/fonts/inter.WOFF2"),
      RequestClass::StaticAsset
    );
    assert_eq!(
      classify("https://app.example.com/logo.png"),
      RequestClass::Image
    );
    assert_eq!(
      classify("https://app.example.com/photo.JPEG?size=large"),
      RequestClass::Image
    );
  }

  #[test]
  fn test_everything_else_is_a_page() {
    assert_eq!(classify("https://app.example.com/"), RequestClass::HtmlPage);
    assert_eq!(
      classify("https://app.example.com/settings"),
      RequestClass::HtmlPage
    );
    assert_eq!(
      classify("https://app.example.com/docs/v1.2/intro"),
      RequestClass::HtmlPage
    );
    // Unknown extension falls through to the page class
    assert_eq!(
      classify("https://app.example.com/report.pdf"),
      RequestClass::HtmlPage
    );
  }

  #[test]
  fn test_custom_rules_replace_defaults() {
    let rules = RouteRules {
      api_prefixes: vec!["/v2/".to_string()],
      static_extensions: vec!["wasm".to_string()],
      image_extensions: vec![],
    };
    let classifier = Classifier::new(Url::parse("https://app.example.com").unwrap(), rules);

    let class = |s: &str| classifier.classify(&Url::parse(s).unwrap());
    assert_eq!(class("https://app.example.com/v2/tasks"), RequestClass::Api);
    assert_eq!(
      class("https://app.example.com/api/tasks"),
      RequestClass::HtmlPage
    );
    assert_eq!(
      class("https://app.example.com/app.wasm"),
      RequestClass::StaticAsset
    );
    assert_eq!(
      class("https://app.example.com/logo.png"),
      RequestClass::HtmlPage
    );
  }

  #[test]
  fn test_class_actions() {
    assert_eq!(
      RequestClass::Api.action(),
      Action::NetworkFirst { bucket: "api" }
    );
    assert_eq!(
      RequestClass::HtmlPage.action(),
      Action::NetworkFirst { bucket: "runtime" }
    );
    assert_eq!(
      RequestClass::StaticAsset.action(),
      Action::CacheFirst { bucket: "static" }
    );
    assert_eq!(
      RequestClass::Image.action(),
      Action::CacheFirst { bucket: "image" }
    );
    assert_eq!(RequestClass::ExternalOrigin.action(), Action::NetworkOnly);
  }
}
