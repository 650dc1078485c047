//! Durable queue for mutations issued while offline.
//!
//! Entries survive process restarts and are replayed in insertion order by
//! the sync coordinator. Queue persistence failures always propagate; a
//! mutation that cannot be stored must never be silently dropped.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use tracing::debug;
use url::Url;

use crate::db::{datetime_from_sql, datetime_to_sql, Database};
use crate::http::{HttpRequest, Method};

/// A mutation waiting to be replayed.
#[derive(Debug, Clone)]
pub struct QueuedMutation {
  pub id: u64,
  pub request: HttpRequest,
  pub created_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub last_error: Option<String>,
  /// Replay is deferred until this instant (backoff gate)
  pub next_attempt_at: DateTime<Utc>,
}

/// A mutation abandoned after exhausting its retry budget.
#[derive(Debug, Clone)]
pub struct DeadMutation {
  pub id: u64,
  pub request: HttpRequest,
  pub created_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub last_error: Option<String>,
  pub dead_at: DateTime<Utc>,
}

/// Trait for mutation queue backends.
pub trait MutationStore: Send + Sync {
  /// Durably append a mutation. Returns its queue id (strictly increasing).
  fn enqueue(&self, request: &HttpRequest) -> Result<u64>;

  /// Every queued mutation in id order, without consuming anything.
  fn peek_all(&self) -> Result<Vec<QueuedMutation>>;

  /// Queued mutations whose `next_attempt_at` has passed, in id order.
  fn eligible(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>>;

  /// Delete a mutation once its replay was confirmed successful.
  fn remove(&self, id: u64) -> Result<()>;

  /// Record a failed replay attempt and schedule the next one.
  fn record_failure(&self, id: u64, error: &str, next_attempt_at: DateTime<Utc>) -> Result<()>;

  /// Move a mutation to the dead-letter table. The stored attempt count
  /// includes the attempt that triggered abandonment.
  fn dead_letter(&self, id: u64, error: &str) -> Result<()>;

  /// Number of mutations currently queued.
  fn depth(&self) -> Result<usize>;

  /// Abandoned mutations, oldest first.
  fn dead_letters(&self) -> Result<Vec<DeadMutation>>;
}

/// SQLite-backed mutation queue.
pub struct SqliteQueue {
  db: Database,
}

impl SqliteQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl MutationStore for SqliteQueue {
  fn enqueue(&self, request: &HttpRequest) -> Result<u64> {
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize request headers: {}", e))?;
    let now = datetime_to_sql(Utc::now());

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO mutation_queue
             (method, url, headers, body, created_at, attempt_count, last_error, next_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?5)",
        params![
          request.method.as_str(),
          request.url.as_str(),
          headers,
          request.body,
          now
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    let id = conn.last_insert_rowid() as u64;
    debug!(id, method = %request.method, url = %request.url, "queued mutation");

    Ok(id)
  }

  fn peek_all(&self) -> Result<Vec<QueuedMutation>> {
    self.select_queued("SELECT id, method, url, headers, body, created_at, attempt_count, last_error, next_attempt_at
       FROM mutation_queue ORDER BY id", &[])
  }

  fn eligible(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>> {
    self.select_queued(
      "SELECT id, method, url, headers, body, created_at, attempt_count, last_error, next_attempt_at
       FROM mutation_queue WHERE next_attempt_at <= ?1 ORDER BY id",
      &[&datetime_to_sql(now)],
    )
  }

  fn remove(&self, id: u64) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM mutation_queue WHERE id = ?1", params![id as i64])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;

    Ok(())
  }

  fn record_failure(&self, id: u64, error: &str, next_attempt_at: DateTime<Utc>) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE mutation_queue
         SET attempt_count = attempt_count + 1, last_error = ?2, next_attempt_at = ?3
         WHERE id = ?1",
        params![id as i64, error, datetime_to_sql(next_attempt_at)],
      )
      .map_err(|e| eyre!("Failed to record failure for mutation {}: {}", id, e))?;

    Ok(())
  }

  fn dead_letter(&self, id: u64, error: &str) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin dead-letter transaction: {}", e))?;

    let moved = tx
      .execute(
        "INSERT INTO dead_mutations
             (id, method, url, headers, body, created_at, attempt_count, last_error, dead_at)
         SELECT id, method, url, headers, body, created_at, attempt_count + 1, ?2, ?3
         FROM mutation_queue WHERE id = ?1",
        params![id as i64, error, datetime_to_sql(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to dead-letter mutation {}: {}", id, e))?;

    if moved == 0 {
      return Err(eyre!("No queued mutation with id {}", id));
    }

    tx.execute("DELETE FROM mutation_queue WHERE id = ?1", params![id as i64])
      .map_err(|e| eyre!("Failed to remove dead-lettered mutation {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit dead-letter move: {}", e))?;

    Ok(())
  }

  fn depth(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM mutation_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queued mutations: {}", e))?;

    Ok(count as usize)
  }

  fn dead_letters(&self) -> Result<Vec<DeadMutation>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, body, created_at, attempt_count, last_error, dead_at
         FROM dead_mutations ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare dead-letter query: {}", e))?;

    let rows = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to query dead letters: {}", e))?;

    let mut dead = Vec::new();
    for row in rows {
      let raw = row.map_err(|e| eyre!("Failed to read dead letter: {}", e))?;
      dead.push(DeadMutation {
        id: raw.0 as u64,
        request: rebuild_request(&raw.1, &raw.2, &raw.3, raw.4)?,
        created_at: datetime_from_sql(&raw.5)?,
        attempt_count: raw.6,
        last_error: raw.7,
        dead_at: datetime_from_sql(&raw.8)?,
      });
    }

    Ok(dead)
  }
}

impl SqliteQueue {
  fn select_queued(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<QueuedMutation>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map(args, read_row)
      .map_err(|e| eyre!("Failed to query mutation queue: {}", e))?;

    let mut queued = Vec::new();
    for row in rows {
      let raw = row.map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;
      queued.push(QueuedMutation {
        id: raw.0 as u64,
        request: rebuild_request(&raw.1, &raw.2, &raw.3, raw.4)?,
        created_at: datetime_from_sql(&raw.5)?,
        attempt_count: raw.6,
        last_error: raw.7,
        next_attempt_at: datetime_from_sql(&raw.8)?,
      });
    }

    Ok(queued)
  }
}

type MutationRow = (
  i64,
  String,
  String,
  String,
  Option<Vec<u8>>,
  String,
  u32,
  Option<String>,
  String,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
  ))
}

fn rebuild_request(
  method: &str,
  url: &str,
  headers_json: &str,
  body: Option<Vec<u8>>,
) -> Result<HttpRequest> {
  let method = Method::parse(method)?;
  let url = Url::parse(url).map_err(|e| eyre!("Failed to parse queued url '{}': {}", url, e))?;
  let headers: Vec<(String, String)> = serde_json::from_str(headers_json)
    .map_err(|e| eyre!("Failed to deserialize request headers: {}", e))?;

  let mut request = HttpRequest::new(method, url);
  request.headers = headers;
  request.body = body;

  Ok(request)
}
