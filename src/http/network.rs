//! The network side of routing: a single fetch, classified the way a browser
//! would classify it.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::types::{RequestRecord, ResponseType, StoredResponse};
use crate::config::HttpConfig;

/// Why a fetch produced no response at all.
///
/// An HTTP error status is still a response; these are the cases where the
/// request itself was rejected.
#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("request failed: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("invalid method '{0}'")]
  InvalidMethod(String),
  /// Host unreachable; the connection was never established
  #[error("offline")]
  Offline,
}

/// Fetch primitive used by the orchestrator.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &RequestRecord) -> Result<StoredResponse, NetworkError>;
}

/// `reqwest`-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url, config: &HttpConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.clone())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  fn classify(&self, url: &Url) -> ResponseType {
    if url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &RequestRecord) -> Result<StoredResponse, NetworkError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|_| NetworkError::InvalidMethod(request.method.clone()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_connect() {
        NetworkError::Offline
      } else {
        NetworkError::Transport(e)
      }
    })?;

    let mut requested = request.url.clone();
    requested.set_fragment(None);
    let final_url = response.url().clone();

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?;

    Ok(StoredResponse {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      response_type: self.classify(&final_url),
      redirected: final_url != requested,
      url: final_url.to_string(),
      headers,
      body,
    })
  }
}
