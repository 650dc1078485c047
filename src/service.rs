//! Application facade assembling the cache, queue, transport, and sync
//! components behind one API.
//!
//! Construction performs the explicit startup sequence: open the database,
//! sweep stale cache versions, then spawn the reconnect watcher and the
//! backstop timer. Reads go through [`OfflineService::fetch`], writes
//! through [`OfflineService::submit_mutation`]; the two paths never mix.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::http::{HttpRequest, HttpResponse};
use crate::intercept::{Classifier, FetchOutcome, FetchRouter};
use crate::queue::{DeadMutation, MutationStore, QueuedMutation, SqliteQueue};
use crate::store::{CacheStore, SqliteStore};
use crate::sync::{SyncCoordinator, SyncEvent, SyncResult};
use crate::transport::{HttpTransport, Transport};

/// Result of submitting a mutation.
#[derive(Debug)]
pub enum MutationOutcome {
  /// The upstream answered; whatever its status, nothing was queued
  Sent(HttpResponse),
  /// Stored for replay under this queue id
  Queued(u64),
}

/// Point-in-time snapshot for status surfaces and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
  pub version: String,
  pub online: bool,
  pub buckets: BTreeMap<String, usize>,
  pub queue_depth: usize,
  pub dead_letters: usize,
  pub oldest_pending: Option<DateTime<Utc>>,
}

/// Offline-first request layer over a transport.
pub struct OfflineService<T: Transport + 'static> {
  config: Config,
  store: Arc<SqliteStore>,
  queue: Arc<SqliteQueue>,
  transport: Arc<T>,
  router: FetchRouter<SqliteStore, T>,
  coordinator: Arc<SyncCoordinator<SqliteQueue, T>>,
  connectivity: ConnectivityMonitor,
  events: broadcast::Sender<SyncEvent>,
  tasks: Vec<JoinHandle<()>>,
}

impl OfflineService<HttpTransport> {
  /// Open with the reqwest transport and the configured database location.
  pub fn open(config: Config) -> Result<Self> {
    let transport = HttpTransport::new(Duration::from_secs(config.fetch_timeout_secs))?;
    let db = Database::open(&config.database_path()?)?;

    Self::with_database(config, transport, db)
  }
}

impl<T: Transport + 'static> OfflineService<T> {
  /// Open with a custom transport at the configured database location.
  pub fn with_transport(config: Config, transport: T) -> Result<Self> {
    let db = Database::open(&config.database_path()?)?;

    Self::with_database(config, transport, db)
  }

  /// Full wiring over an already-open database.
  pub fn with_database(config: Config, transport: T, db: Database) -> Result<Self> {
    let origin = config.origin()?;

    let store = Arc::new(SqliteStore::new(
      db.clone(),
      &config.version,
      config.buckets.clone(),
    )?);
    let queue = Arc::new(SqliteQueue::new(db));
    let transport = Arc::new(transport);
    let connectivity = ConnectivityMonitor::new(config.start_online);
    let (events, _) = broadcast::channel(64);

    let router = FetchRouter::new(
      Arc::clone(&store),
      Arc::clone(&transport),
      Classifier::new(origin, config.routes.clone()),
      Duration::from_secs(config.fetch_timeout_secs),
    );

    let coordinator = Arc::new(SyncCoordinator::new(
      Arc::clone(&queue),
      Arc::clone(&transport),
      connectivity.subscribe(),
      events.clone(),
      config.retry,
      Duration::from_secs(config.replay_timeout_secs),
    ));

    let mut tasks = Vec::new();

    let drain_on_reconnect = {
      let coordinator = Arc::clone(&coordinator);
      move || {
        let coordinator = Arc::clone(&coordinator);
        async move {
          if let Err(err) = coordinator.drain().await {
            warn!(error = %err, "reconnect drain failed");
          }
        }
      }
    };
    tasks.push(connectivity.spawn_on_reconnect(
      Duration::from_millis(config.reconnect_debounce_ms),
      drain_on_reconnect,
    ));

    if config.backstop_interval_secs > 0 {
      tasks.push(coordinator.spawn_backstop(Duration::from_secs(config.backstop_interval_secs)));
    }

    info!(
      version = %config.version,
      online = connectivity.is_online(),
      "offline service ready"
    );

    Ok(Self {
      config,
      store,
      queue,
      transport,
      router,
      coordinator,
      connectivity,
      events,
      tasks,
    })
  }

  /// Serve a read request through the interception layer.
  pub async fn fetch(&self, request: &HttpRequest) -> Result<FetchOutcome> {
    self.router.dispatch(request).await
  }

  /// Submit a mutation: send it now when the link is up, queue it when it
  /// is down or the transport fails under us. A served non-2xx response is
  /// still `Sent`; the server answered and a retry would not change that.
  pub async fn submit_mutation(&self, request: &HttpRequest) -> Result<MutationOutcome> {
    require_mutation(request)?;

    if !self.connectivity.is_online() {
      let id = self.queue.enqueue(request)?;
      return Ok(MutationOutcome::Queued(id));
    }

    match self.transport.send(request).await {
      Ok(response) => Ok(MutationOutcome::Sent(response)),
      Err(err) => {
        warn!(url = %request.url, error = %err, "mutation send failed, queueing for replay");
        let id = self.queue.enqueue(request)?;
        Ok(MutationOutcome::Queued(id))
      }
    }
  }

  /// Queue a mutation without touching the network.
  pub fn enqueue_mutation(&self, request: &HttpRequest) -> Result<u64> {
    require_mutation(request)?;
    self.queue.enqueue(request)
  }

  /// Manually trigger a drain cycle.
  pub async fn drain_queue(&self) -> Result<SyncResult> {
    self.coordinator.drain().await
  }

  pub fn queue_depth(&self) -> Result<usize> {
    self.queue.depth()
  }

  pub fn pending_mutations(&self) -> Result<Vec<QueuedMutation>> {
    self.queue.peek_all()
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadMutation>> {
    self.queue.dead_letters()
  }

  pub fn clear_bucket(&self, bucket: &str) -> Result<()> {
    self.store.clear_bucket(bucket)
  }

  pub fn clear_all(&self) -> Result<()> {
    self.store.clear_all()
  }

  /// Subscribe to drain lifecycle events.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// The connectivity monitor. Platform signals feed `set_online`; an
  /// offline-to-online edge triggers a debounced drain.
  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  /// Snapshot of cache and queue state.
  pub fn status(&self) -> Result<ServiceStatus> {
    let mut buckets = BTreeMap::new();
    for name in self.store.bucket_names() {
      buckets.insert(name.to_string(), self.store.bucket_len(name)?);
    }

    let pending = self.queue.peek_all()?;

    Ok(ServiceStatus {
      version: self.config.version.clone(),
      online: self.connectivity.is_online(),
      buckets,
      queue_depth: pending.len(),
      dead_letters: self.queue.dead_letters()?.len(),
      oldest_pending: pending.first().map(|m| m.created_at),
    })
  }
}

impl<T: Transport + 'static> Drop for OfflineService<T> {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

fn require_mutation(request: &HttpRequest) -> Result<()> {
  if request.method.is_mutation() {
    Ok(())
  } else {
    Err(eyre!(
      "{} {} is not a mutating request; use fetch for reads",
      request.method,
      request.url
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::intercept::ResponseSource;
  use crate::transport::testing::FakeTransport;
  use tokio::time::sleep;
  use url::Url;

  fn test_config() -> Config {
    let mut config = Config::for_origin("https://app.example.com").unwrap();
    config.version = "v1".to_string();
    config.reconnect_debounce_ms = 50;
    // Timers stay quiet unless a test turns them on
    config.backstop_interval_secs = 0;
    config
  }

  fn service(transport: FakeTransport) -> OfflineService<FakeTransport> {
    OfflineService::with_database(test_config(), transport, Database::open_in_memory().unwrap())
      .unwrap()
  }

  fn get(path: &str) -> HttpRequest {
    HttpRequest::get(Url::parse(&format!("https://app.example.com{}", path)).unwrap())
  }

  fn post(path: &str) -> HttpRequest {
    HttpRequest::post(
      Url::parse(&format!("https://app.example.com{}", path)).unwrap(),
      b"{}".to_vec(),
    )
  }

  #[tokio::test]
  async fn test_fetch_serves_reads_through_the_cache() {
    let svc = service(FakeTransport::ok());

    let live = svc.fetch(&get("/assets/app.js")).await.unwrap();
    assert_eq!(live.source, ResponseSource::Network);

    let cached = svc.fetch(&get("/assets/app.js")).await.unwrap();
    assert_eq!(cached.source, ResponseSource::CacheFresh);
  }

  #[tokio::test]
  async fn test_submit_mutation_online_sends_directly() {
    let svc = service(FakeTransport::ok());

    match svc.submit_mutation(&post("/api/tasks")).await.unwrap() {
      MutationOutcome::Sent(response) => assert_eq!(response.status, 200),
      other => panic!("expected Sent, got {:?}", other),
    }
    assert_eq!(svc.queue_depth().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_submit_mutation_offline_queues_immediately() {
    let svc = service(FakeTransport::ok());
    svc.connectivity().set_online(false);

    match svc.submit_mutation(&post("/api/tasks")).await.unwrap() {
      MutationOutcome::Queued(id) => assert!(id > 0),
      other => panic!("expected Queued, got {:?}", other),
    }
    assert_eq!(svc.queue_depth().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_submit_mutation_transport_failure_falls_back_to_queue() {
    let svc = service(FakeTransport::failing());

    match svc.submit_mutation(&post("/api/tasks")).await.unwrap() {
      MutationOutcome::Queued(_) => {}
      other => panic!("expected Queued, got {:?}", other),
    }
    assert_eq!(svc.queue_depth().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_submit_mutation_rejected_response_is_sent_not_queued() {
    let transport = FakeTransport::ok();
    transport.push(|_| Ok(HttpResponse::new(409).with_body(b"conflict".to_vec())));
    let svc = service(transport);

    match svc.submit_mutation(&post("/api/tasks")).await.unwrap() {
      MutationOutcome::Sent(response) => assert_eq!(response.status, 409),
      other => panic!("expected Sent, got {:?}", other),
    }
    assert_eq!(svc.queue_depth().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_reads_are_refused_on_the_write_path() {
    let svc = service(FakeTransport::ok());

    assert!(svc.submit_mutation(&get("/api/tasks")).await.is_err());
    assert!(svc.enqueue_mutation(&get("/api/tasks")).is_err());
  }

  #[tokio::test]
  async fn test_reconnect_edge_drains_the_queue() {
    let svc = service(FakeTransport::ok());
    svc.connectivity().set_online(false);

    svc.submit_mutation(&post("/api/tasks/1")).await.unwrap();
    svc.submit_mutation(&post("/api/tasks/2")).await.unwrap();
    assert_eq!(svc.queue_depth().unwrap(), 2);

    let mut events = svc.subscribe();
    svc.connectivity().set_online(true);
    sleep(Duration::from_millis(300)).await;

    assert_eq!(svc.queue_depth().unwrap(), 0);
    assert!(matches!(
      events.recv().await.unwrap(),
      SyncEvent::Started { pending: 2 }
    ));
    match events.recv().await.unwrap() {
      SyncEvent::Complete(result) => assert_eq!(result.succeeded, 2),
      other => panic!("expected Complete, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_queued_mutations_survive_restart_and_replay_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    {
      let mut config = test_config();
      config.start_online = false;
      let svc = OfflineService::with_database(
        config,
        FakeTransport::ok(),
        Database::open(&path).unwrap(),
      )
      .unwrap();

      svc.submit_mutation(&post("/api/tasks")).await.unwrap();
      assert_eq!(svc.queue_depth().unwrap(), 1);
    }

    // "Restarted" process: same database file, fresh wiring
    let transport = FakeTransport::ok();
    let svc = OfflineService::with_database(
      test_config(),
      transport,
      Database::open(&path).unwrap(),
    )
    .unwrap();

    assert_eq!(svc.queue_depth().unwrap(), 1);

    let result = svc.drain_queue().await.unwrap();
    assert_eq!(result.succeeded, 1);
    assert_eq!(svc.queue_depth().unwrap(), 0);

    // A second drain finds nothing; the mutation ran exactly once
    let again = svc.drain_queue().await.unwrap();
    assert_eq!(again.processed, 0);
  }

  #[tokio::test]
  async fn test_status_snapshot() {
    let svc = service(FakeTransport::ok());

    svc.fetch(&get("/api/tasks")).await.unwrap();
    svc.connectivity().set_online(false);
    svc.submit_mutation(&post("/api/tasks")).await.unwrap();

    let status = svc.status().unwrap();
    assert_eq!(status.version, "v1");
    assert!(!status.online);
    assert_eq!(status.buckets["api"], 1);
    assert_eq!(status.buckets["static"], 0);
    assert_eq!(status.queue_depth, 1);
    assert_eq!(status.dead_letters, 0);
    assert!(status.oldest_pending.is_some());
  }

  #[tokio::test]
  async fn test_clear_bucket_through_the_facade() {
    let svc = service(FakeTransport::ok());
    svc.fetch(&get("/api/tasks")).await.unwrap();
    svc.fetch(&get("/logo.png")).await.unwrap();

    svc.clear_bucket("api").unwrap();

    let status = svc.status().unwrap();
    assert_eq!(status.buckets["api"], 0);
    assert_eq!(status.buckets["image"], 1);
  }
}
