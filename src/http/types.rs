//! Request and response records exchanged between the orchestrator, the
//! network and the cache storage.

use bytes::Bytes;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Browser-classified purpose of a request.
///
/// Only `Document` requests are eligible for the offline fallback page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// Full page navigation
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  /// No destination (fetch/XHR)
  #[default]
  Empty,
}

impl Destination {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Document => "document",
      Self::Image => "image",
      Self::Script => "script",
      Self::Style => "style",
      Self::Font => "font",
      Self::Manifest => "manifest",
      Self::Empty => "",
    }
  }
}

/// Identity of an intercepted fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
  /// Upper-cased HTTP method
  pub method: String,
  pub url: Url,
  pub destination: Destination,
  /// Request headers, names lower-cased
  pub headers: BTreeMap<String, String>,
}

impl RequestRecord {
  /// A plain `GET` with no destination.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      destination: Destination::Empty,
      headers: BTreeMap::new(),
    }
  }

  /// A top-level page navigation.
  #[cfg(test)]
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// URL used for cache identity: the fragment never takes part in matching.
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Stable, fixed-length storage key for this request.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.cache_url());

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Values of the request headers named by a response's `Vary`, as they
  /// must be remembered next to a stored entry. Absent headers map to "".
  pub fn vary_snapshot(&self, response: &StoredResponse) -> BTreeMap<String, String> {
    match response.vary() {
      Vary::Headers(names) => names
        .into_iter()
        .map(|name| {
          let value = self.header(&name).unwrap_or_default().to_string();
          (name, value)
        })
        .collect(),
      Vary::None | Vary::Any => BTreeMap::new(),
    }
  }
}

impl fmt::Display for RequestRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)?;
    match self.destination {
      Destination::Empty => Ok(()),
      destination => write!(f, " [{}]", destination.as_str()),
    }
  }
}

/// Response type as a browser reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response with readable body
  Cors,
  /// Cross-origin response with inaccessible body/status
  Opaque,
  /// Redirect returned unfollowed
  OpaqueRedirect,
  Error,
}

impl ResponseType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::OpaqueRedirect => "opaqueredirect",
      Self::Error => "error",
    }
  }
}

impl FromStr for ResponseType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "basic" => Ok(Self::Basic),
      "cors" => Ok(Self::Cors),
      "opaque" => Ok(Self::Opaque),
      "opaqueredirect" => Ok(Self::OpaqueRedirect),
      "error" => Ok(Self::Error),
      other => Err(format!("unknown response type '{}'", other)),
    }
  }
}

/// Parsed `Vary` response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vary {
  None,
  /// `Vary: *`, never matches a later request
  Any,
  /// Lower-cased request header names
  Headers(Vec<String>),
}

/// A response as returned by the network and as persisted in a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub status_text: String,
  pub response_type: ResponseType,
  /// Whether the network followed at least one redirect
  pub redirected: bool,
  /// Final response URL
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl StoredResponse {
  /// Build a same-origin response with no headers.
  #[cfg(test)]
  pub fn basic(status: u16, url: &Url, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      status_text: String::new(),
      response_type: ResponseType::Basic,
      redirected: false,
      url: url.to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_type(mut self, response_type: ResponseType) -> Self {
    self.response_type = response_type;
    self
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  /// `ok` in the fetch sense: any 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether a network response may be copied into the dynamic partition:
  /// status exactly 200, same-origin, not redirected.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic && !self.redirected
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn vary(&self) -> Vary {
    let Some(value) = self.header("vary") else {
      return Vary::None;
    };

    let names: Vec<String> = value
      .split(',')
      .map(|n| n.trim().to_ascii_lowercase())
      .filter(|n| !n.is_empty())
      .collect();

    if names.iter().any(|n| n == "*") {
      Vary::Any
    } else if names.is_empty() {
      Vary::None
    } else {
      Vary::Headers(names)
    }
  }

  /// Check a stored entry against an incoming request, given the request
  /// header values remembered when the entry was stored.
  pub fn vary_matches(&self, stored: &BTreeMap<String, String>, request: &RequestRecord) -> bool {
    match self.vary() {
      Vary::None => true,
      Vary::Any => false,
      Vary::Headers(names) => names.iter().all(|name| {
        let then = stored.get(name).map(String::as_str).unwrap_or_default();
        let now = request.header(name).unwrap_or_default();
        then == now
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_display_names_destination() {
    let plain = RequestRecord::get(url("http://localhost:3000/skills.md"));
    assert_eq!(plain.to_string(), "GET http://localhost:3000/skills.md");

    let page = RequestRecord::navigate(url("http://localhost:3000/"));
    assert_eq!(page.to_string(), "GET http://localhost:3000/ [document]");
  }

  #[test]
  fn test_cache_key_ignores_fragment() {
    let a = RequestRecord::get(url("http://localhost:3000/index.html#skills"));
    let b = RequestRecord::get(url("http://localhost:3000/index.html"));
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key().len(), 64);
  }

  #[test]
  fn test_cache_key_depends_on_method() {
    let get = RequestRecord::get(url("http://localhost:3000/"));
    let post = get.clone().with_method("post");
    assert_eq!(post.method, "POST");
    assert_ne!(get.cache_key(), post.cache_key());
  }

  #[test]
  fn test_header_names_case_insensitive() {
    let req = RequestRecord::get(url("http://localhost:3000/")).with_header("Accept-Language", "lt");
    assert_eq!(req.header("accept-language"), Some("lt"));
    assert_eq!(req.header("ACCEPT-LANGUAGE"), Some("lt"));
  }

  #[test]
  fn test_cacheable_requires_200_basic_not_redirected() {
    let u = url("http://localhost:3000/skills.md");
    assert!(StoredResponse::basic(200, &u, "x").is_cacheable());
    assert!(!StoredResponse::basic(204, &u, "").is_cacheable());
    assert!(!StoredResponse::basic(404, &u, "").is_cacheable());
    assert!(!StoredResponse::basic(200, &u, "x")
      .with_type(ResponseType::Opaque)
      .is_cacheable());
    assert!(!StoredResponse::basic(200, &u, "x")
      .with_type(ResponseType::Cors)
      .is_cacheable());

    let mut redirected = StoredResponse::basic(200, &u, "x");
    redirected.redirected = true;
    assert!(!redirected.is_cacheable());
  }

  #[test]
  fn test_vary_parsing() {
    let u = url("http://localhost:3000/");
    assert_eq!(StoredResponse::basic(200, &u, "").vary(), Vary::None);
    assert_eq!(
      StoredResponse::basic(200, &u, "")
        .with_header("Vary", "Accept-Encoding, Accept-Language")
        .vary(),
      Vary::Headers(vec!["accept-encoding".into(), "accept-language".into()])
    );
    assert_eq!(
      StoredResponse::basic(200, &u, "")
        .with_header("Vary", "Origin, *")
        .vary(),
      Vary::Any
    );
  }

  #[test]
  fn test_vary_matches_remembered_headers() {
    let u = url("http://localhost:3000/");
    let response = StoredResponse::basic(200, &u, "").with_header("Vary", "Accept-Language");
    let english = RequestRecord::get(u.clone()).with_header("Accept-Language", "en");
    let lithuanian = RequestRecord::get(u.clone()).with_header("Accept-Language", "lt");

    let snapshot = english.vary_snapshot(&response);
    assert!(response.vary_matches(&snapshot, &english));
    assert!(!response.vary_matches(&snapshot, &lithuanian));
  }

  #[test]
  fn test_vary_any_never_matches() {
    let u = url("http://localhost:3000/");
    let response = StoredResponse::basic(200, &u, "").with_header("Vary", "*");
    let req = RequestRecord::get(u);
    assert!(!response.vary_matches(&BTreeMap::new(), &req));
  }

  #[test]
  fn test_response_type_round_trips_through_str() {
    for t in [
      ResponseType::Basic,
      ResponseType::Cors,
      ResponseType::Opaque,
      ResponseType::OpaqueRedirect,
      ResponseType::Error,
    ] {
      assert_eq!(t.as_str().parse::<ResponseType>(), Ok(t));
    }
    assert!("bogus".parse::<ResponseType>().is_err());
  }
}
