//! Shared SQLite handle for the cache buckets and the mutation queue.
//!
//! Both stores ride one connection behind a mutex, so every persistence
//! operation is serialized against the others regardless of which task
//! (interception layer, sync coordinator, application thread) issued it.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle to the backing database. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open (or create) the database at the given path and apply the schema.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    conn
      .execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
      )
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// In-memory database for tests; schema applied, no journaling pragmas.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;

    Ok(db)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the shared connection. A poisoned lock surfaces as an error rather
  /// than a panic so persistence failures stay explicit.
  pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for the cache buckets, the mutation queue, and the dead-letter
/// table. `insert_seq` is a global monotonic counter driving FIFO eviction;
/// `next_attempt_at` gates retry backoff.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    version     TEXT NOT NULL,
    bucket      TEXT NOT NULL,
    entry_key   TEXT NOT NULL,
    status      INTEGER NOT NULL,
    headers     TEXT NOT NULL,
    body        BLOB NOT NULL,
    stored_at   TEXT NOT NULL,
    insert_seq  INTEGER NOT NULL,
    PRIMARY KEY (version, bucket, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_fifo
    ON cache_entries(version, bucket, insert_seq);

CREATE TABLE IF NOT EXISTS mutation_queue (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    method          TEXT NOT NULL,
    url             TEXT NOT NULL,
    headers         TEXT NOT NULL,
    body            BLOB,
    created_at      TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    next_attempt_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_eligible
    ON mutation_queue(next_attempt_at, id);

CREATE TABLE IF NOT EXISTS dead_mutations (
    id            INTEGER PRIMARY KEY,
    method        TEXT NOT NULL,
    url           TEXT NOT NULL,
    headers       TEXT NOT NULL,
    body          BLOB,
    created_at    TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    last_error    TEXT,
    dead_at       TEXT NOT NULL
);
"#;

/// Render a timestamp for TEXT storage.
pub(crate) fn datetime_to_sql(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339()
}

/// Parse a timestamp stored by [`datetime_to_sql`].
pub(crate) fn datetime_from_sql(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
