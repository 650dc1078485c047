//! Cache store trait and SQLite implementation.
//!
//! Responses live in named buckets, each with a capacity cap and an optional
//! TTL. Every row carries the version tag the store was opened with; opening
//! a store under a new tag purges everything written under older tags.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::db::{datetime_from_sql, datetime_to_sql, Database};
use crate::http::{CacheEntry, HttpResponse};

/// Capacity and freshness policy for one bucket.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BucketPolicy {
  /// Hard cap on entries; the oldest insertions are evicted beyond it
  pub max_entries: usize,
  /// Entries older than this count as stale; absent means never stale
  pub ttl_secs: Option<u64>,
}

/// Trait for cache store backends.
pub trait CacheStore: Send + Sync {
  /// Store an entry under (bucket, key), evicting the oldest insertions if
  /// the bucket would exceed its capacity. Unknown buckets are an error.
  fn write(&self, bucket: &str, key: &str, entry: &CacheEntry) -> Result<()>;

  /// Look up an entry. Misses are `None`; storage failures are errors.
  fn read(&self, bucket: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Drop every entry in one bucket (current version only).
  fn clear_bucket(&self, bucket: &str) -> Result<()>;

  /// Drop every cached entry, any version.
  fn clear_all(&self) -> Result<()>;

  /// Number of entries currently held in a bucket.
  fn bucket_len(&self, bucket: &str) -> Result<usize>;

  /// The bucket's freshness window, if it has one.
  fn bucket_ttl(&self, bucket: &str) -> Option<Duration>;
}

/// SQLite-backed cache store.
pub struct SqliteStore {
  db: Database,
  version: String,
  buckets: BTreeMap<String, BucketPolicy>,
}

impl SqliteStore {
  /// Create a store scoped to `version`. Rows written under any other
  /// version are deleted before the store serves its first read.
  pub fn new(
    db: Database,
    version: &str,
    buckets: BTreeMap<String, BucketPolicy>,
  ) -> Result<Self> {
    let store = Self {
      db,
      version: version.to_string(),
      buckets,
    };
    store.sweep_stale_versions()?;
    Ok(store)
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
    self.buckets.keys().map(|s| s.as_str())
  }

  fn sweep_stale_versions(&self) -> Result<()> {
    let conn = self.db.conn()?;

    let swept = conn
      .execute(
        "DELETE FROM cache_entries WHERE version <> ?1",
        params![self.version],
      )
      .map_err(|e| eyre!("Failed to sweep stale cache versions: {}", e))?;

    if swept > 0 {
      info!(version = %self.version, swept, "purged cache entries from previous versions");
    }

    Ok(())
  }

  fn policy(&self, bucket: &str) -> Result<BucketPolicy> {
    self
      .buckets
      .get(bucket)
      .copied()
      .ok_or_else(|| eyre!("Unknown cache bucket: {}", bucket))
  }
}

impl CacheStore for SqliteStore {
  fn write(&self, bucket: &str, key: &str, entry: &CacheEntry) -> Result<()> {
    let policy = self.policy(bucket)?;

    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize response headers: {}", e))?;

    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin cache transaction: {}", e))?;

    // Re-writing an existing key takes a fresh sequence number, so the key
    // moves to the back of the eviction order.
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
           (version, bucket, entry_key, status, headers, body, stored_at, insert_seq)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
           (SELECT COALESCE(MAX(insert_seq), 0) + 1 FROM cache_entries))",
      params![
        self.version,
        bucket,
        key,
        entry.response.status,
        headers,
        entry.response.body,
        datetime_to_sql(entry.stored_at)
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries
       WHERE version = ?1 AND bucket = ?2 AND entry_key NOT IN (
           SELECT entry_key FROM cache_entries
           WHERE version = ?1 AND bucket = ?2
           ORDER BY insert_seq DESC
           LIMIT ?3)",
      params![self.version, bucket, policy.max_entries as i64],
    )
    .map_err(|e| eyre!("Failed to trim bucket '{}': {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache write: {}", e))?;

    Ok(())
  }

  fn read(&self, bucket: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE version = ?1 AND bucket = ?2 AND entry_key = ?3",
      )
      .map_err(|e| eyre!("Failed to prepare cache lookup: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![self.version, bucket, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers_json, body, stored_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)
          .map_err(|e| eyre!("Failed to deserialize response headers: {}", e))?;

        let mut response = HttpResponse::new(status).with_body(body);
        response.headers = headers;

        Ok(Some(CacheEntry {
          response,
          stored_at: datetime_from_sql(&stored_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn clear_bucket(&self, bucket: &str) -> Result<()> {
    // Reject unknown names so a typo doesn't report a successful clear
    self.policy(bucket)?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE version = ?1 AND bucket = ?2",
        params![self.version, bucket],
      )
      .map_err(|e| eyre!("Failed to clear bucket '{}': {}", bucket, e))?;

    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }

  fn bucket_len(&self, bucket: &str) -> Result<usize> {
    let conn = self.db.conn()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE version = ?1 AND bucket = ?2",
        params![self.version, bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count bucket '{}': {}", bucket, e))?;

    Ok(count as usize)
  }

  fn bucket_ttl(&self, bucket: &str) -> Option<Duration> {
    self
      .buckets
      .get(bucket)
      .and_then(|p| p.ttl_secs)
      .map(|secs| Duration::seconds(secs as i64))
  }
}
