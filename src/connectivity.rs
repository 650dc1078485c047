//! Connectivity state shared across the subsystem.
//!
//! The embedding platform pushes online/offline transitions into the
//! monitor; the interception layer and sync coordinator observe it through
//! watch receivers. Reconnect actions are debounced so a flapping link
//! produces one drain, not one per blip.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
  rx: watch::Receiver<bool>,
}

impl ConnectivityMonitor {
  pub fn new(start_online: bool) -> Self {
    let (tx, rx) = watch::channel(start_online);
    Self { tx, rx }
  }

  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }

  /// Record a platform connectivity signal. Same-value signals are absorbed
  /// without waking watchers.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current != online {
        *current = online;
        true
      } else {
        false
      }
    });

    if changed {
      info!(online, "connectivity changed");
    }
  }

  /// A receiver positioned at the current value; `changed()` fires only on
  /// later transitions.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Watch for offline-to-online edges and run `action` once per settled
  /// edge. After an edge the task waits out `debounce`, re-reads the state,
  /// and only acts if the link is still up, collapsing rapid flapping into
  /// a single invocation.
  pub fn spawn_on_reconnect<F, Fut>(&self, debounce: Duration, action: F) -> JoinHandle<()>
  where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut rx = self.tx.subscribe();

    tokio::spawn(async move {
      let mut was_online = *rx.borrow();

      loop {
        if rx.changed().await.is_err() {
          // Monitor dropped, nothing left to watch
          break;
        }

        let now_online = *rx.borrow_and_update();
        let reconnected = !was_online && now_online;
        was_online = now_online;

        if !reconnected {
          continue;
        }

        tokio::time::sleep(debounce).await;

        // Re-read after the settle window; toggles during the sleep are
        // consumed here so they cannot queue up extra invocations.
        let settled = *rx.borrow_and_update();
        was_online = settled;

        if settled {
          debug!("connectivity restored");
          action().await;
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use tokio::time::sleep;

  fn counting_action(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> {
    let counter = Arc::clone(counter);
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      std::future::ready(())
    }
  }

  #[test]
  fn test_set_online_visible_to_readers() {
    let monitor = ConnectivityMonitor::new(false);
    assert!(!monitor.is_online());

    monitor.set_online(true);
    assert!(monitor.is_online());

    let rx = monitor.subscribe();
    assert!(*rx.borrow());
  }

  #[tokio::test]
  async fn test_reconnect_fires_once_after_debounce() {
    let monitor = ConnectivityMonitor::new(false);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = monitor.spawn_on_reconnect(Duration::from_millis(50), counting_action(&fired));

    monitor.set_online(true);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    handle.abort();
  }

  #[tokio::test]
  async fn test_flapping_collapses_to_one_invocation() {
    let monitor = ConnectivityMonitor::new(false);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = monitor.spawn_on_reconnect(Duration::from_millis(100), counting_action(&fired));

    monitor.set_online(true);
    sleep(Duration::from_millis(10)).await;
    monitor.set_online(false);
    sleep(Duration::from_millis(10)).await;
    monitor.set_online(true);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    handle.abort();
  }

  #[tokio::test]
  async fn test_no_invocation_when_link_settles_offline() {
    let monitor = ConnectivityMonitor::new(false);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = monitor.spawn_on_reconnect(Duration::from_millis(100), counting_action(&fired));

    monitor.set_online(true);
    sleep(Duration::from_millis(10)).await;
    monitor.set_online(false);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    handle.abort();
  }

  #[tokio::test]
  async fn test_online_start_needs_a_real_edge() {
    let monitor = ConnectivityMonitor::new(true);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = monitor.spawn_on_reconnect(Duration::from_millis(50), counting_action(&fired));

    // Redundant online signals are not an edge
    monitor.set_online(true);
    sleep(Duration::from_millis(150)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    handle.abort();
  }
}
