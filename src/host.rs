//! Hosting runtime: delivers lifecycle events to an orchestrator and waits
//! for the work each one signals.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheStorage, Registration, SqliteStorage};
use crate::config::Config;
use crate::http::{Destination, HttpNetwork, RequestRecord};
use crate::worker::{CacheOrchestrator, Routed, WorkerSettings};

type Orchestrator = CacheOrchestrator<SqliteStorage, HttpNetwork>;

/// What an install event did.
#[derive(Debug)]
pub struct InstallOutcome {
  /// Resources provisioned into the static partition
  pub cached: usize,
  /// Stale partitions removed by the follow-up activation
  pub deleted: Vec<String>,
  /// Activation errors; the new version is in control regardless
  pub activation_error: Option<String>,
}

#[derive(Debug)]
pub struct PartitionStatus {
  pub name: String,
  pub entries: usize,
  /// Named by the configured version tags
  pub current: bool,
}

#[derive(Debug)]
pub struct Status {
  pub registration: Option<Registration>,
  pub partitions: Vec<PartitionStatus>,
}

pub struct Host {
  config: Config,
  storage: Arc<SqliteStorage>,
  network: Arc<HttpNetwork>,
}

impl Host {
  pub fn open(config: Config) -> Result<Self> {
    let storage = SqliteStorage::open_at(&config.database_path()?)?;
    let network = HttpNetwork::new(config.origin.clone(), &config.http)?;

    Ok(Self {
      config,
      storage: Arc::new(storage),
      network: Arc::new(network),
    })
  }

  /// Install the configured version: provision, then skip waiting straight
  /// into activation.
  ///
  /// A failed provision leaves the previous registration in control.
  pub async fn install(&self) -> Result<InstallOutcome> {
    let settings = WorkerSettings::from_config(&self.config)?;
    let mut orchestrator = CacheOrchestrator::new(
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
      settings,
    );

    let cached = orchestrator.provision().await.map_err(|e| {
      eyre!(
        "Install of {} failed, previous version stays in control: {}",
        self.config.static_cache,
        e
      )
    })?;

    let mut outcome = InstallOutcome {
      cached,
      deleted: Vec::new(),
      activation_error: None,
    };

    if orchestrator.skip_waiting() {
      match orchestrator.activate().await {
        Ok(report) => outcome.deleted = report.deleted,
        Err(e) => {
          warn!("Activation error: {}", e);
          outcome.activation_error = Some(e.to_string());
        }
      }
    }

    Ok(outcome)
  }

  /// Orchestrator for whichever version is currently registered.
  fn active_orchestrator(&self) -> Result<Orchestrator> {
    let registration = self
      .storage
      .registration()?
      .ok_or_else(|| eyre!("No active cache version. Run `shellcache install` first."))?;

    if registration.static_cache != self.config.static_cache {
      info!(
        "Routing through registered version {} (configured: {})",
        registration.static_cache, self.config.static_cache
      );
    }

    let settings = WorkerSettings::from_config(&self.config)?.for_registration(&registration);
    Ok(CacheOrchestrator::resume(
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
      settings,
    ))
  }

  /// Build a request for a URL or an origin-relative path.
  pub fn request(
    &self,
    target: &str,
    method: &str,
    destination: Destination,
    headers: &[String],
  ) -> Result<RequestRecord> {
    let mut request = RequestRecord::get(self.config.resolve(target)?)
      .with_method(method)
      .with_destination(destination);

    for header in headers {
      let (name, value) = header
        .split_once(':')
        .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
      request = request.with_header(name.trim(), value.trim());
    }

    Ok(request)
  }

  /// Route one request, then wait for any background cache write.
  pub async fn fetch(&self, request: &RequestRecord) -> Result<Routed> {
    let orchestrator = self.active_orchestrator()?;
    let routed = orchestrator.route(request).await;
    orchestrator.flush().await;
    Ok(routed?)
  }

  /// Deliver a sync event; `None` uses the configured tag.
  pub async fn sync(&self, tag: Option<&str>) -> Result<bool> {
    let orchestrator = self.active_orchestrator()?;
    let tag = tag.unwrap_or(&self.config.sync_tag);
    Ok(orchestrator.sync(tag).await)
  }

  pub fn status(&self) -> Result<Status> {
    let partitions = self
      .storage
      .keys()?
      .into_iter()
      .map(|name| {
        let entries = self.storage.entry_count(&name)?;
        let current = name == self.config.static_cache || name == self.config.dynamic_cache;
        Ok(PartitionStatus {
          name,
          entries,
          current,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Status {
      registration: self.storage.registration()?,
      partitions,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::worker::RouteSource;
  use std::path::Path;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn site() -> MockServer {
    let server = MockServer::start().await;
    for (route, body) in [
      ("/", "<html>root</html>"),
      ("/index.html", "<html>shell</html>"),
      ("/skills.md", "# Skills"),
      ("/images/badge.png", "png"),
    ] {
      Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    }
    server
  }

  fn config_for(server: &MockServer, db: &Path, version: &str) -> Config {
    Config {
      origin: url::Url::parse(&server.uri()).unwrap(),
      static_cache: format!("static-{}", version),
      dynamic_cache: format!("dynamic-{}", version),
      precache: vec!["/".into(), "/index.html".into(), "/skills.md".into()],
      database: Some(db.to_path_buf()),
      ..Config::default()
    }
  }

  #[tokio::test]
  async fn test_fetch_before_install_is_error() {
    let server = site().await;
    let dir = tempfile::tempdir().unwrap();
    let host = Host::open(config_for(&server, &dir.path().join("cache.db"), "v1")).unwrap();

    let request = host.request("/", "GET", Destination::Document, &[]).unwrap();
    let err = host.fetch(&request).await.unwrap_err();
    assert!(err.to_string().contains("shellcache install"));
  }

  #[tokio::test]
  async fn test_install_then_fetch_round() {
    let server = site().await;
    let dir = tempfile::tempdir().unwrap();
    let host = Host::open(config_for(&server, &dir.path().join("cache.db"), "v1")).unwrap();

    let outcome = host.install().await.unwrap();
    assert_eq!(outcome.cached, 3);
    assert!(outcome.activation_error.is_none());

    let shell = host.request("/index.html", "GET", Destination::Document, &[]).unwrap();
    let routed = host.fetch(&shell).await.unwrap();
    assert_eq!(routed.source, RouteSource::Cache);

    let badge = host
      .request("/images/badge.png", "GET", Destination::Image, &[])
      .unwrap();
    assert_eq!(host.fetch(&badge).await.unwrap().source, RouteSource::Network);
    assert_eq!(host.fetch(&badge).await.unwrap().source, RouteSource::Cache);

    let status = host.status().unwrap();
    let dynamic = status
      .partitions
      .iter()
      .find(|p| p.name == "dynamic-v1")
      .unwrap();
    assert_eq!(dynamic.entries, 1);
    assert!(dynamic.current);
  }

  #[tokio::test]
  async fn test_new_version_prunes_old_and_failed_install_keeps_old() {
    let server = site().await;
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    Host::open(config_for(&server, &db, "v1"))
      .unwrap()
      .install()
      .await
      .unwrap();

    // v2 lists a resource the site does not have: install must fail
    let mut broken = config_for(&server, &db, "v2");
    broken.precache.push("/missing.css".into());
    let host = Host::open(broken).unwrap();
    assert!(host.install().await.is_err());
    let registration = host.status().unwrap().registration.unwrap();
    assert_eq!(registration.static_cache, "static-v1");

    // Routing still goes through v1
    let skills = host.request("/skills.md", "GET", Destination::Empty, &[]).unwrap();
    let routed = host.fetch(&skills).await.unwrap();
    assert_eq!(routed.partition.as_deref(), Some("static-v1"));

    let host = Host::open(config_for(&server, &db, "v2")).unwrap();
    let outcome = host.install().await.unwrap();
    assert!(outcome.deleted.contains(&"static-v1".to_string()));

    let names: Vec<String> = host
      .status()
      .unwrap()
      .partitions
      .into_iter()
      .map(|p| p.name)
      .collect();
    assert!(names.contains(&"static-v2".to_string()));
    assert!(!names.contains(&"static-v1".to_string()));
  }

  #[tokio::test]
  async fn test_request_parses_headers() {
    let server = site().await;
    let dir = tempfile::tempdir().unwrap();
    let host = Host::open(config_for(&server, &dir.path().join("cache.db"), "v1")).unwrap();

    let request = host
      .request(
        "/skills.md",
        "get",
        Destination::Empty,
        &["Accept-Language: lt".to_string()],
      )
      .unwrap();
    assert_eq!(request.method, "GET");
    assert_eq!(request.header("accept-language"), Some("lt"));

    assert!(host
      .request("/", "GET", Destination::Empty, &["no-colon".to_string()])
      .is_err());
  }

  #[tokio::test]
  async fn test_sync_requires_active_version() {
    let server = site().await;
    let dir = tempfile::tempdir().unwrap();
    let host = Host::open(config_for(&server, &dir.path().join("cache.db"), "v1")).unwrap();

    assert!(host.sync(None).await.is_err());
    host.install().await.unwrap();
    assert!(host.sync(None).await.unwrap());
    assert!(!host.sync(Some("other")).await.unwrap());
  }
}
