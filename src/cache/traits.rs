//! Core trait and types for the partitioned response cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{RequestRecord, StoredResponse};

/// A response found in one of the partitions.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: StoredResponse,
  /// Partition the entry was found in
  pub partition: String,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
}

/// Version tags currently in control of routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
  pub static_cache: String,
  pub dynamic_cache: String,
  pub activated_at: DateTime<Utc>,
}

/// Durable, named cache partitions mapping requests to responses.
///
/// Only `GET` requests are ever stored or matched. Implementations must be
/// safe for concurrent independent writes; callers add no locking.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  #[cfg(test)]
  fn has(&self, name: &str) -> Result<bool>;

  /// Partition names in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Destroy a partition and its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look a request up across all partitions, oldest partition first.
  fn match_request(&self, request: &RequestRecord) -> Result<Option<CachedEntry>>;

  /// Look a request up in a single partition.
  #[cfg(test)]
  fn match_in(&self, name: &str, request: &RequestRecord) -> Result<Option<CachedEntry>>;

  /// Store (or replace) a single entry, creating the partition if needed.
  fn put(&self, name: &str, request: &RequestRecord, response: &StoredResponse) -> Result<()>;

  /// Store several entries atomically: either all are written or none.
  fn put_all(&self, name: &str, entries: &[(RequestRecord, StoredResponse)]) -> Result<()>;

  fn entry_count(&self, name: &str) -> Result<usize>;

  fn registration(&self) -> Result<Option<Registration>>;

  /// Record which version tags are in control.
  fn set_registration(&self, static_cache: &str, dynamic_cache: &str) -> Result<()>;
}
