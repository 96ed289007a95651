//! Failures of the three lifecycle operations.

use color_eyre::Report;
use std::fmt;
use thiserror::Error;

use super::lifecycle::Phase;
use crate::http::NetworkError;

/// Install failed; the orchestrator never becomes active.
#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error("cannot provision while {0}")]
  Phase(Phase),
  #[error("failed to fetch {url}: {source}")]
  Fetch {
    url: String,
    #[source]
    source: NetworkError,
  },
  #[error("{url} is listed more than once")]
  Duplicate { url: String },
  #[error("{url} responded with status {status}")]
  Status { url: String, status: u16 },
  #[error("cache storage failed: {0}")]
  Storage(Report),
}

/// A single partition operation that failed during activation.
#[derive(Debug)]
pub struct PartitionFailure {
  pub partition: String,
  pub reason: String,
}

impl fmt::Display for PartitionFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.partition, self.reason)
  }
}

/// Activation finished with errors. The orchestrator is active regardless;
/// nothing here is retried.
#[derive(Debug, Error)]
pub enum ActivationError {
  #[error("cannot activate while {0}")]
  Phase(Phase),
  #[error("failed to enumerate cache partitions: {0}")]
  Enumerate(Report),
  #[error("{} partition operation(s) failed: {}", .0.len(), join_failures(.0))]
  Partitions(Vec<PartitionFailure>),
}

fn join_failures(failures: &[PartitionFailure]) -> String {
  failures
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}

/// No response could be produced for a request.
#[derive(Debug, Error)]
pub enum RouteError {
  #[error("cannot route while {0}")]
  Phase(Phase),
  /// Network failed and there was no cache entry or fallback to serve
  #[error("no response for {request}: {source}")]
  NetworkFailure {
    request: String,
    #[source]
    source: NetworkError,
  },
}
