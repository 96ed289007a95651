use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use url::Url;

/// Where the site is served during development. A valid absolute URL, so
/// parsing it cannot fail.
const DEFAULT_ORIGIN: &str = "http://localhost:3000";

/// Resources pre-cached into the static partition at install time.
const DEFAULT_PRECACHE: &[&str] = &[
  "/",
  "/index.html",
  "/images/profile-photo.jpg",
  "/manifest.json",
  "/skills.md",
  "https://cdn.tailwindcss.com",
  "https://cdn.jsdelivr.net/npm/chart.js",
  "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the site is served from; relative identifiers resolve against it
  pub origin: Url,
  /// Versioned name of the pre-populated partition
  pub static_cache: String,
  /// Versioned name of the lazily populated partition
  pub dynamic_cache: String,
  /// Identifiers fetched into the static partition, all-or-nothing
  pub precache: Vec<String>,
  /// Page shell served to offline navigations
  pub fallback_document: String,
  /// Background sync tag that triggers the sync task
  pub sync_tag: String,
  /// Cache database location (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  pub database: Option<PathBuf>,
  pub http: HttpConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse(DEFAULT_ORIGIN).expect("DEFAULT_ORIGIN is a valid URL"),
      static_cache: "static-v2".to_string(),
      dynamic_cache: "dynamic-v2".to_string(),
      precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
      fallback_document: "/index.html".to_string(),
      sync_tag: "background-sync".to_string(),
      database: None,
      http: HttpConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  /// Whole-request timeout in seconds
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("shellcache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.static_cache.is_empty() || self.dynamic_cache.is_empty() {
      return Err(eyre!("Cache names must not be empty"));
    }
    if self.static_cache == self.dynamic_cache {
      return Err(eyre!(
        "static_cache and dynamic_cache must differ (both are '{}')",
        self.static_cache
      ));
    }
    // Fail early on identifiers that cannot be resolved or repeat
    let mut seen = HashSet::new();
    for (identifier, mut url) in self.precache.iter().zip(self.precache_urls()?) {
      url.set_fragment(None);
      if !seen.insert(url) {
        return Err(eyre!("Precache lists '{}' more than once", identifier));
      }
    }
    self.fallback_url()?;
    Ok(())
  }

  /// Resolve an identifier (relative or absolute) against the origin.
  pub fn resolve(&self, identifier: &str) -> Result<Url> {
    self
      .origin
      .join(identifier)
      .map_err(|e| eyre!("Invalid resource identifier '{}': {}", identifier, e))
  }

  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self.precache.iter().map(|id| self.resolve(id)).collect()
  }

  pub fn fallback_url(&self) -> Result<Url> {
    self.resolve(&self.fallback_document)
  }

  /// Database path, defaulting to the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_match_site() {
    let config = Config::default();
    assert_eq!(config.static_cache, "static-v2");
    assert_eq!(config.dynamic_cache, "dynamic-v2");
    assert_eq!(config.precache.len(), 8);
    assert_eq!(config.sync_tag, "background-sync");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_precache_resolves_relative_and_absolute() {
    let config = Config::default();
    let urls = config.precache_urls().unwrap();
    assert_eq!(urls[0].as_str(), "http://localhost:3000/");
    assert_eq!(urls[4].as_str(), "http://localhost:3000/skills.md");
    assert_eq!(urls[6].as_str(), "https://cdn.jsdelivr.net/npm/chart.js");
    assert_eq!(
      config.fallback_url().unwrap().as_str(),
      "http://localhost:3000/index.html"
    );
  }

  #[test]
  fn test_load_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "origin: https://cv.example.com\nstatic_cache: static-v3\nprecache:\n  - /\n  - /index.html\nhttp:\n  timeout_secs: 5"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.origin.as_str(), "https://cv.example.com/");
    assert_eq!(config.static_cache, "static-v3");
    assert_eq!(config.dynamic_cache, "dynamic-v2");
    assert_eq!(config.precache, vec!["/", "/index.html"]);
    assert_eq!(config.http.timeout_secs, 5);
    assert!(config.http.user_agent.starts_with("shellcache/"));
  }

  #[test]
  fn test_missing_explicit_file_is_error() {
    let err = Config::load(Some(Path::new("/nonexistent/shellcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_identical_cache_names_rejected() {
    let config = Config {
      dynamic_cache: "static-v2".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_default_origin_parses() {
    assert_eq!(
      Url::parse(DEFAULT_ORIGIN).unwrap(),
      Config::default().origin
    );
  }

  #[test]
  fn test_duplicate_precache_rejected() {
    let config = Config {
      precache: vec![
        "/".into(),
        "/skills.md".into(),
        "http://localhost:3000/skills.md#top".into(),
      ],
      ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("more than once"));
  }

  #[test]
  fn test_explicit_database_path_wins() {
    let config = Config {
      database: Some(PathBuf::from("/tmp/cv-cache.db")),
      ..Config::default()
    };
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/cv-cache.db")
    );
  }
}
