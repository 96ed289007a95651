//! Lifecycle phases and the per-version settings an orchestrator runs with.

use color_eyre::Result;
use std::fmt;
use url::Url;

use crate::cache::Registration;
use crate::config::Config;

/// Lifecycle phase of one orchestrator instance.
///
/// Phases only move forward: `Installing → Activating → Active`, or
/// `Installing → Redundant` when provisioning fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Installing,
  Activating,
  Active,
  /// Failed to install; never takes control
  Redundant,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Everything an orchestrator needs besides storage and network.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub static_cache: String,
  pub dynamic_cache: String,
  pub precache: Vec<Url>,
  /// Page shell for offline navigations
  pub fallback: Url,
  pub sync_tag: String,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      static_cache: config.static_cache.clone(),
      dynamic_cache: config.dynamic_cache.clone(),
      precache: config.precache_urls()?,
      fallback: config.fallback_url()?,
      sync_tag: config.sync_tag.clone(),
    })
  }

  /// Same settings, but routing through the partitions a registration names.
  pub fn for_registration(self, registration: &Registration) -> Self {
    Self {
      static_cache: registration.static_cache.clone(),
      dynamic_cache: registration.dynamic_cache.clone(),
      ..self
    }
  }

  /// Whether a partition belongs to the current version.
  pub fn is_current(&self, partition: &str) -> bool {
    partition == self.static_cache || partition == self.dynamic_cache
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  #[test]
  fn test_settings_from_default_config() {
    let settings = WorkerSettings::from_config(&Config::default()).unwrap();
    assert_eq!(settings.precache.len(), 8);
    assert_eq!(settings.fallback.as_str(), "http://localhost:3000/index.html");
    assert!(settings.is_current("static-v2"));
    assert!(settings.is_current("dynamic-v2"));
    assert!(!settings.is_current("arturas-cv-v2"));
    assert!(!settings.is_current("static-v1"));
  }

  #[test]
  fn test_for_registration_swaps_versions_only() {
    let settings = WorkerSettings::from_config(&Config::default()).unwrap();
    let registration = Registration {
      static_cache: "static-v1".to_string(),
      dynamic_cache: "dynamic-v1".to_string(),
      activated_at: Utc::now(),
    };

    let old = settings.clone().for_registration(&registration);
    assert!(old.is_current("static-v1"));
    assert!(!old.is_current("static-v2"));
    assert_eq!(old.precache, settings.precache);
  }

  #[test]
  fn test_phase_display() {
    assert_eq!(Phase::Installing.to_string(), "installing");
    assert_eq!(Phase::Redundant.to_string(), "redundant");
  }
}
