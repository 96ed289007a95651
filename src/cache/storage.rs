//! SQLite implementation of the partitioned cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStorage, CachedEntry, Registration};
use crate::db::Database;
use crate::http::{RequestRecord, ResponseType, StoredResponse};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    let db = Database::open(path)?;
    Ok(Self::from_database(db))
  }

  /// Storage that lives only as long as this value.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self::from_database(db))
  }

  fn from_database(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_conn()),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Create the partition if missing and return its id.
fn ensure_partition(conn: &Connection, name: &str) -> Result<i64> {
  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;

  conn
    .query_row(
      "SELECT id FROM partitions WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to look up partition {}: {}", name, e))
}

fn insert_entry(
  conn: &Connection,
  partition_id: i64,
  request: &RequestRecord,
  response: &StoredResponse,
) -> Result<()> {
  if !request.is_get() {
    return Err(eyre!(
      "Request method '{}' is unsupported for caching",
      request.method
    ));
  }

  let vary = serde_json::to_string(&request.vary_snapshot(response))
    .map_err(|e| eyre!("Failed to serialize vary headers: {}", e))?;
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (partition_id, request_key, method, url, vary_headers, status, status_text,
          response_type, redirected, response_url, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition_id,
        request.cache_key(),
        request.method,
        request.cache_url(),
        vary,
        response.status,
        response.status_text,
        response.response_type.as_str(),
        response.redirected,
        response.url,
        headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", request, e))?;

  Ok(())
}

/// Raw entry columns, decoded outside the rusqlite row callback.
struct EntryRow {
  partition: String,
  vary_headers: String,
  status: u16,
  status_text: String,
  response_type: String,
  redirected: bool,
  response_url: String,
  headers: String,
  body: Vec<u8>,
  stored_at: String,
}

impl EntryRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      partition: row.get(0)?,
      vary_headers: row.get(1)?,
      status: row.get(2)?,
      status_text: row.get(3)?,
      response_type: row.get(4)?,
      redirected: row.get(5)?,
      response_url: row.get(6)?,
      headers: row.get(7)?,
      body: row.get(8)?,
      stored_at: row.get(9)?,
    })
  }

  /// Decode into an entry if it satisfies the request's `Vary` headers.
  fn into_match(self, request: &RequestRecord) -> Result<Option<CachedEntry>> {
    let headers: Vec<(String, String)> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
    let vary: BTreeMap<String, String> = serde_json::from_str(&self.vary_headers)
      .map_err(|e| eyre!("Failed to deserialize vary headers: {}", e))?;
    let response_type: ResponseType = self.response_type.parse().map_err(|e| eyre!("{}", e))?;

    let response = StoredResponse {
      status: self.status,
      status_text: self.status_text,
      response_type,
      redirected: self.redirected,
      url: self.response_url,
      headers,
      body: Bytes::from(self.body),
    };

    if !response.vary_matches(&vary, request) {
      return Ok(None);
    }

    Ok(Some(CachedEntry {
      response,
      partition: self.partition,
      stored_at: parse_datetime(&self.stored_at)?,
    }))
  }
}

const SELECT_ENTRY: &str = "SELECT p.name, e.vary_headers, e.status, e.status_text, e.response_type,
        e.redirected, e.response_url, e.headers, e.body, e.stored_at
   FROM entries e
   INNER JOIN partitions p ON p.id = e.partition_id";

/// First entry among `rows` whose vary headers match the request.
fn first_match(rows: Vec<EntryRow>, request: &RequestRecord) -> Result<Option<CachedEntry>> {
  for row in rows {
    if let Some(entry) = row.into_match(request)? {
      return Ok(Some(entry));
    }
  }
  Ok(None)
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_partition(&conn, name)?;
    Ok(())
  }

  #[cfg(test)]
  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM partitions WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up partition {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;
    Ok(removed > 0)
  }

  fn match_request(&self, request: &RequestRecord) -> Result<Option<CachedEntry>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!("{} WHERE e.request_key = ? ORDER BY p.id", SELECT_ENTRY))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![request.cache_key()], EntryRow::from_row)
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    first_match(rows, request)
  }

  #[cfg(test)]
  fn match_in(&self, name: &str, request: &RequestRecord) -> Result<Option<CachedEntry>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "{} WHERE p.name = ? AND e.request_key = ?",
        SELECT_ENTRY
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![name, request.cache_key()], EntryRow::from_row)
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    first_match(rows, request)
  }

  fn put(&self, name: &str, request: &RequestRecord, response: &StoredResponse) -> Result<()> {
    let conn = self.lock()?;
    let partition_id = ensure_partition(&conn, name)?;
    insert_entry(&conn, partition_id, request, response)
  }

  fn put_all(&self, name: &str, entries: &[(RequestRecord, StoredResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let partition_id = ensure_partition(&tx, name)?;
    for (request, response) in entries {
      // Dropping the transaction on error rolls everything back
      insert_entry(&tx, partition_id, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries e
         INNER JOIN partitions p ON p.id = e.partition_id
         WHERE p.name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries in {}: {}", name, e))?;
    Ok(count as usize)
  }

  fn registration(&self) -> Result<Option<Registration>> {
    let conn = self.lock()?;
    let row: Option<(String, String, String)> = conn
      .query_row(
        "SELECT static_cache, dynamic_cache, activated_at FROM registration WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read registration: {}", e))?;

    match row {
      Some((static_cache, dynamic_cache, activated_at)) => Ok(Some(Registration {
        static_cache,
        dynamic_cache,
        activated_at: parse_datetime(&activated_at)?,
      })),
      None => Ok(None),
    }
  }

  fn set_registration(&self, static_cache: &str, dynamic_cache: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO registration (id, static_cache, dynamic_cache, activated_at)
         VALUES (1, ?, ?, datetime('now'))",
        params![static_cache, dynamic_cache],
      )
      .map_err(|e| eyre!("Failed to update registration: {}", e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
