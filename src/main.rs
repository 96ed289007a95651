mod cache;
mod config;
mod db;
mod host;
mod http;
mod logging;
mod worker;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use crate::http::Destination;
use crate::worker::RouteSource;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline page-shell cache with cache-first fetch routing")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also write logs to this file
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Provision the configured version and activate it, pruning stale caches
  Install,
  /// Route one request through the active cache
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Request destination; only `document` gets the offline page shell
    #[arg(short, long, value_enum, default_value_t = Destination::Document)]
    destination: Destination,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Extra request header ("Name: value"), repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Deliver a background sync event
  Sync {
    /// Sync tag (default: the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show the active version and cache partitions
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let host = host::Host::open(config)?;

  match args.command {
    Command::Install => {
      let outcome = host.install().await?;
      println!("Cached {} static resources", outcome.cached);
      for name in &outcome.deleted {
        println!("Deleted old cache {}", name);
      }
      if let Some(e) = outcome.activation_error {
        println!("Activated with errors: {}", e);
      }
    }
    Command::Fetch {
      url,
      destination,
      method,
      headers,
      output,
    } => {
      let request = host.request(&url, &method, destination, &headers)?;
      let routed = host.fetch(&request).await?;

      let label = match routed.source {
        RouteSource::Cache => "cache",
        RouteSource::Network => "network",
        RouteSource::OfflineFallback => "offline-fallback",
      };
      let source = match (&routed.partition, routed.cached_at) {
        (Some(partition), Some(at)) => format!("{} {}, stored {}", label, partition, at),
        _ => label.to_string(),
      };
      info!(
        "{} -> {} {} ({}, {} bytes)",
        request,
        routed.response.status,
        routed.response.status_text,
        source,
        routed.response.body.len()
      );

      match output {
        Some(path) => std::fs::write(&path, &routed.response.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout().write_all(&routed.response.body)?,
      }
    }
    Command::Sync { tag } => {
      if !host.sync(tag.as_deref()).await? {
        println!("Sync tag not handled");
      }
    }
    Command::Status => {
      let status = host.status()?;
      match status.registration {
        Some(reg) => println!(
          "Active: {} / {} (since {})",
          reg.static_cache, reg.dynamic_cache, reg.activated_at
        ),
        None => println!("Active: none"),
      }
      for partition in status.partitions {
        let marker = if partition.current { "" } else { " (stale)" };
        println!(
          "  {:<24} {:>6} entries{}",
          partition.name, partition.entries, marker
        );
      }
    }
  }

  Ok(())
}
