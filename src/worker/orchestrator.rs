//! Cache-first request routing over the static and dynamic partitions.

use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::error::{ActivationError, PartitionFailure, ProvisionError, RouteError};
use super::lifecycle::{Phase, WorkerSettings};
use crate::cache::{CacheStorage, CachedEntry};
use crate::http::{Destination, Network, RequestRecord, StoredResponse};

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
  /// Served from a partition without touching the network
  Cache,
  /// Fresh data from network
  Network,
  /// Network unavailable; the page shell stood in for a navigation
  OfflineFallback,
}

/// Result of routing one request.
#[derive(Debug, Clone)]
pub struct Routed {
  pub response: StoredResponse,
  pub source: RouteSource,
  /// Partition the response was served from (if from cache)
  pub partition: Option<String>,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Routed {
  fn from_network(response: StoredResponse) -> Self {
    Self {
      response,
      source: RouteSource::Network,
      partition: None,
      cached_at: None,
    }
  }

  fn from_cache(entry: CachedEntry) -> Self {
    Self::cached(entry, RouteSource::Cache)
  }

  fn offline(entry: CachedEntry) -> Self {
    Self::cached(entry, RouteSource::OfflineFallback)
  }

  fn cached(entry: CachedEntry, source: RouteSource) -> Self {
    Self {
      response: entry.response,
      source,
      partition: Some(entry.partition),
      cached_at: Some(entry.stored_at),
    }
  }
}

/// Outcome of a successful activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Stale partitions destroyed
  pub deleted: Vec<String>,
}

/// Mediates every fetch through cache-first, then network, then offline
/// fallback, and keeps the partitions in line with the current version.
///
/// One instance is one lifecycle: provision, activate, then route until
/// superseded by an instance with new version tags.
pub struct CacheOrchestrator<S, N> {
  storage: Arc<S>,
  network: Arc<N>,
  settings: WorkerSettings,
  phase: Phase,
  /// Set once provisioning asked to take over without waiting
  skip_waiting: bool,
  /// Dynamic-partition writes not yet awaited by anyone.
  /// Never locked across an await.
  pending: Mutex<JoinSet<()>>,
}

impl<S, N> CacheOrchestrator<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  /// A fresh instance, ready to install.
  pub fn new(storage: Arc<S>, network: Arc<N>, settings: WorkerSettings) -> Self {
    Self {
      storage,
      network,
      settings,
      phase: Phase::Installing,
      skip_waiting: false,
      pending: Mutex::new(JoinSet::new()),
    }
  }

  /// An instance for a version that already went through activation.
  pub fn resume(storage: Arc<S>, network: Arc<N>, settings: WorkerSettings) -> Self {
    Self {
      phase: Phase::Active,
      ..Self::new(storage, network, settings)
    }
  }

  #[cfg(test)]
  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting
  }

  /// Populate the static partition with every pre-declared resource.
  ///
  /// All-or-nothing: if any single fetch fails or returns a non-2xx status,
  /// nothing is written and the instance becomes redundant.
  pub async fn provision(&mut self) -> Result<usize, ProvisionError> {
    if self.phase != Phase::Installing {
      return Err(ProvisionError::Phase(self.phase));
    }

    match self.populate_static().await {
      Ok(count) => {
        info!(
          "Cached {} static assets into {}",
          count, self.settings.static_cache
        );
        self.skip_waiting = true;
        self.phase = Phase::Activating;
        Ok(count)
      }
      Err(e) => {
        warn!("Provisioning {} failed: {}", self.settings.static_cache, e);
        self.phase = Phase::Redundant;
        Err(e)
      }
    }
  }

  async fn populate_static(&self) -> Result<usize, ProvisionError> {
    // A repeated request fails the whole batch
    let mut seen = HashSet::new();
    for url in &self.settings.precache {
      let request = RequestRecord::get(url.clone());
      if !seen.insert(request.cache_key()) {
        return Err(ProvisionError::Duplicate {
          url: request.cache_url(),
        });
      }
    }

    self
      .storage
      .open(&self.settings.static_cache)
      .map_err(ProvisionError::Storage)?;

    info!("Caching static assets");

    let fetches = self.settings.precache.iter().map(|url| {
      let request = RequestRecord::get(url.clone());
      let network = Arc::clone(&self.network);
      async move {
        let response = network
          .fetch(&request)
          .await
          .map_err(|source| ProvisionError::Fetch {
            url: request.url.to_string(),
            source,
          })?;

        if !response.is_ok() {
          return Err(ProvisionError::Status {
            url: request.url.to_string(),
            status: response.status,
          });
        }

        Ok((request, response))
      }
    });

    let entries = try_join_all(fetches).await?;

    self
      .storage
      .put_all(&self.settings.static_cache, &entries)
      .map_err(ProvisionError::Storage)?;

    Ok(entries.len())
  }

  /// Destroy every partition not named by the current version, then claim
  /// control of routing.
  ///
  /// Deletions run independently and are all awaited. The instance becomes
  /// active even when some of them fail; the failures are returned together.
  pub async fn activate(&mut self) -> Result<ActivationReport, ActivationError> {
    if self.phase != Phase::Activating {
      return Err(ActivationError::Phase(self.phase));
    }

    let result = self.prune_and_claim().await;
    self.phase = Phase::Active;

    if let Err(e) = &result {
      warn!("Activation finished with errors: {}", e);
    }
    result
  }

  async fn prune_and_claim(&self) -> Result<ActivationReport, ActivationError> {
    let names = self.storage.keys().map_err(ActivationError::Enumerate)?;

    let deletions = names
      .into_iter()
      .filter(|name| !self.settings.is_current(name))
      .map(|name| {
        let storage = Arc::clone(&self.storage);
        async move {
          info!("Deleting old cache: {}", name);
          let outcome = tokio::task::spawn_blocking({
            let name = name.clone();
            move || storage.delete(&name)
          })
          .await;

          match outcome {
            Ok(Ok(_)) => Ok(name),
            Ok(Err(e)) => Err(PartitionFailure {
              partition: name,
              reason: e.to_string(),
            }),
            Err(e) => Err(PartitionFailure {
              partition: name,
              reason: e.to_string(),
            }),
          }
        }
      });

    let mut report = ActivationReport::default();
    let mut failures = Vec::new();
    for outcome in join_all(deletions).await {
      match outcome {
        Ok(name) => report.deleted.push(name),
        Err(failure) => failures.push(failure),
      }
    }

    // Claim clients: routing now goes through this version's partitions
    if let Err(e) = self
      .storage
      .set_registration(&self.settings.static_cache, &self.settings.dynamic_cache)
    {
      failures.push(PartitionFailure {
        partition: "registration".to_string(),
        reason: e.to_string(),
      });
    }

    if failures.is_empty() {
      Ok(report)
    } else {
      Err(ActivationError::Partitions(failures))
    }
  }

  /// Produce a response for one intercepted request.
  ///
  /// 1. Any partition holding the request wins, with no freshness check.
  /// 2. Otherwise the network answers; a 200 same-origin, non-redirected
  ///    response is copied into the dynamic partition in the background.
  /// 3. If the network fails, navigations get the page shell. Anything
  ///    else has no response.
  pub async fn route(&self, request: &RequestRecord) -> Result<Routed, RouteError> {
    if self.phase != Phase::Active {
      return Err(RouteError::Phase(self.phase));
    }

    if let Some(entry) = self.lookup(request.clone()).await {
      debug!("{} served from {}", request, entry.partition);
      return Ok(Routed::from_cache(entry));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() && request.is_get() {
          debug!(
            "{} fetched, storing into {}",
            request, self.settings.dynamic_cache
          );
          self.store_dynamic(request.clone(), response.clone());
        } else {
          debug!(
            "{} fetched, not cached (status {}, type {})",
            request,
            response.status,
            response.response_type.as_str()
          );
        }
        Ok(Routed::from_network(response))
      }
      Err(source) => {
        if request.destination == Destination::Document {
          let shell = RequestRecord::get(self.settings.fallback.clone());
          if let Some(entry) = self.lookup(shell).await {
            info!("{} offline, serving {}", request, self.settings.fallback);
            return Ok(Routed::offline(entry));
          }
        }

        debug!("{} failed with no cached response: {}", request, source);
        Err(RouteError::NetworkFailure {
          request: request.to_string(),
          source,
        })
      }
    }
  }

  /// Match across all partitions off the async worker threads.
  ///
  /// A broken lookup is a miss, not a failed request.
  async fn lookup(&self, request: RequestRecord) -> Option<CachedEntry> {
    let storage = Arc::clone(&self.storage);
    let outcome = tokio::task::spawn_blocking(move || {
      let found = storage.match_request(&request);
      (request, found)
    })
    .await;

    match outcome {
      Ok((_, Ok(entry))) => entry,
      Ok((request, Err(e))) => {
        warn!("Cache lookup failed for {}: {}", request, e);
        None
      }
      Err(e) => {
        warn!("Cache lookup did not complete: {}", e);
        None
      }
    }
  }

  fn pending(&self) -> MutexGuard<'_, JoinSet<()>> {
    // The set stays consistent even if a holder panicked
    self
      .pending
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Queue a write into the dynamic partition without waiting for it.
  fn store_dynamic(&self, request: RequestRecord, response: StoredResponse) {
    let storage = Arc::clone(&self.storage);
    let partition = self.settings.dynamic_cache.clone();

    let mut pending = self.pending();
    // Reap writes that already finished
    while pending.try_join_next().is_some() {}

    pending.spawn_blocking(move || {
      if let Err(e) = storage.put(&partition, &request, &response) {
        warn!("Failed to cache {} into {}: {}", request, partition, e);
      }
    });
  }

  /// Wait for every queued background write to finish, including writes
  /// queued while waiting. Routing is never blocked by a flush.
  pub async fn flush(&self) {
    loop {
      let mut batch = std::mem::take(&mut *self.pending());
      if batch.is_empty() {
        return;
      }

      while let Some(result) = batch.join_next().await {
        if let Err(e) = result {
          warn!("Background cache write did not complete: {}", e);
        }
      }
    }
  }

  /// Handle a background sync event. Returns whether the tag was recognized.
  pub async fn sync(&self, tag: &str) -> bool {
    if tag != self.settings.sync_tag {
      debug!("Ignoring sync tag '{}'", tag);
      return false;
    }

    self.background_sync().await;
    true
  }

  async fn background_sync(&self) {
    info!("Background sync triggered");
  }
}
