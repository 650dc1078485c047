//! Sync coordinator: replays the mutation queue once connectivity returns.
//!
//! One drain runs at a time. Entries are replayed strictly in queue order;
//! a successful replay removes its entry before the next one is attempted,
//! so losing connectivity mid-drain checkpoints cleanly and a later drain
//! resumes over only the unconfirmed remainder.

use chrono::{Duration as ChronoDuration, Utc};
use color_eyre::{Report, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::http::{HttpRequest, HttpResponse};
use crate::queue::MutationStore;
use crate::transport::Transport;

/// Counters for one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
  /// Entries a replay was attempted for
  pub processed: usize,
  /// Replays confirmed and removed from the queue
  pub succeeded: usize,
  /// Replays that failed this cycle (includes dead-lettered entries)
  pub failed: usize,
  /// Entries abandoned to the dead-letter table this cycle
  pub dead_lettered: usize,
}

/// Drain lifecycle broadcast to subscribers (status surfaces, logging).
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// A drain cycle began over this many eligible entries
  Started { pending: usize },
  /// The cycle visited every eligible entry, possibly with failures
  Complete(SyncResult),
  /// The cycle stopped early; the partial counts are what it got through
  Failed { result: SyncResult, reason: String },
}

/// Replays queued mutations against the transport, strictly in order.
pub struct SyncCoordinator<Q: MutationStore, T: Transport> {
  queue: Arc<Q>,
  transport: Arc<T>,
  online: watch::Receiver<bool>,
  events: broadcast::Sender<SyncEvent>,
  retry: RetryPolicy,
  replay_timeout: Duration,
  draining: AtomicBool,
}

/// Clears the drain flag on every exit path.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl<Q: MutationStore, T: Transport> SyncCoordinator<Q, T> {
  pub fn new(
    queue: Arc<Q>,
    transport: Arc<T>,
    online: watch::Receiver<bool>,
    events: broadcast::Sender<SyncEvent>,
    retry: RetryPolicy,
    replay_timeout: Duration,
  ) -> Self {
    Self {
      queue,
      transport,
      online,
      events,
      retry,
      replay_timeout,
      draining: AtomicBool::new(false),
    }
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }

  /// Run one drain cycle over the currently eligible entries.
  ///
  /// A trigger while offline, or while another drain is in flight, is a
  /// no-op returning an empty result; the queue is left untouched.
  /// Queue-persistence failures abort the cycle and propagate.
  pub async fn drain(&self) -> Result<SyncResult> {
    if !*self.online.borrow() {
      debug!("drain requested while offline, deferring");
      return Ok(SyncResult::default());
    }

    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("drain already in flight, relying on it");
      return Ok(SyncResult::default());
    }
    let _guard = DrainGuard(&self.draining);

    let pending = self
      .queue
      .eligible(Utc::now())
      .map_err(|e| self.abort_cycle(SyncResult::default(), e))?;

    if pending.is_empty() {
      return Ok(SyncResult::default());
    }

    info!(pending = pending.len(), "sync started");
    self.broadcast(SyncEvent::Started {
      pending: pending.len(),
    });

    let mut result = SyncResult::default();

    for mutation in pending {
      // Checkpoint: confirmed entries are already gone, the rest wait for
      // the next cycle
      if !*self.online.borrow() {
        warn!(
          processed = result.processed,
          "connectivity lost mid-drain, checkpointing"
        );
        self.broadcast(SyncEvent::Failed {
          result,
          reason: "connectivity lost mid-drain".to_string(),
        });
        return Ok(result);
      }

      result.processed += 1;

      match self.replay(&mutation.request).await {
        Ok(()) => {
          self
            .queue
            .remove(mutation.id)
            .map_err(|e| self.abort_cycle(result, e))?;
          result.succeeded += 1;
          debug!(id = mutation.id, url = %mutation.request.url, "replayed mutation");
        }
        Err(reason) => {
          result.failed += 1;
          let attempts = mutation.attempt_count + 1;

          if attempts >= self.retry.max_attempts {
            warn!(
              id = mutation.id,
              attempts,
              reason = %reason,
              "mutation exhausted its retry budget, moving to dead letters"
            );
            self
              .queue
              .dead_letter(mutation.id, &reason)
              .map_err(|e| self.abort_cycle(result, e))?;
            result.dead_lettered += 1;
          } else {
            let delay = self.backoff_delay(attempts);
            debug!(
              id = mutation.id,
              attempts,
              delay_secs = delay.num_seconds(),
              reason = %reason,
              "replay failed, backing off"
            );
            self
              .queue
              .record_failure(mutation.id, &reason, Utc::now() + delay)
              .map_err(|e| self.abort_cycle(result, e))?;
          }
        }
      }
    }

    info!(
      processed = result.processed,
      succeeded = result.succeeded,
      failed = result.failed,
      dead_lettered = result.dead_lettered,
      "sync complete"
    );
    self.broadcast(SyncEvent::Complete(result));

    Ok(result)
  }

  /// Drain periodically as a backstop for entries waiting out their backoff
  /// window, since those produce no reconnect edge to react to.
  pub fn spawn_backstop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()>
  where
    Q: 'static,
    T: 'static,
  {
    let coordinator = Arc::clone(self);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;

        if !*coordinator.online.borrow() {
          continue;
        }

        match coordinator.queue.depth() {
          Ok(0) => {}
          Ok(_) => {
            if let Err(err) = coordinator.drain().await {
              warn!(error = %err, "backstop drain failed");
            }
          }
          Err(err) => warn!(error = %err, "backstop depth check failed"),
        }
      }
    })
  }

  /// One replay attempt under the bounded timeout. `Ok` only for a served
  /// 2xx; everything else is the failure reason.
  async fn replay(&self, request: &HttpRequest) -> std::result::Result<(), String> {
    let attempt = tokio::time::timeout(self.replay_timeout, self.transport.send(request)).await;

    match attempt {
      Ok(Ok(response)) if response.is_success() => Ok(()),
      Ok(Ok(response)) => Err(replay_rejection(&response)),
      Ok(Err(err)) => Err(err.to_string()),
      Err(_) => Err(format!(
        "replay timed out after {}s",
        self.replay_timeout.as_secs()
      )),
    }
  }

  fn backoff_delay(&self, attempts: u32) -> ChronoDuration {
    let exp = attempts.saturating_sub(1).min(20);
    let secs = self
      .retry
      .base_delay_secs
      .saturating_mul(1u64 << exp)
      .min(self.retry.max_delay_secs);

    ChronoDuration::seconds(secs as i64)
  }

  fn abort_cycle(&self, result: SyncResult, err: Report) -> Report {
    self.broadcast(SyncEvent::Failed {
      result,
      reason: err.to_string(),
    });
    err
  }

  fn broadcast(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

fn replay_rejection(response: &HttpResponse) -> String {
  format!("upstream returned {}", response.status)
}
