// src/merge/supervisor.rs

use crate::runtime::{Fiber, Promise, Scope};

use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::trace;

/// Owns the fibers a concurrent combinator started.
///
/// When the combinator's scope closes, `shutdown` completes, the driver is
/// interrupted and every worker is awaited. Workers race their work against
/// `shutdown` so they can release what they hold before exiting.
pub(crate) struct Supervisor {
  pub(crate) shutdown: Promise<()>,
  driver: Mutex<Option<Fiber<(), ()>>>,
  workers: Mutex<Vec<Fiber<(), ()>>>,
}

impl Supervisor {
  /// Creates a supervisor that stops with `scope`.
  pub(crate) async fn new_in(scope: &Scope) -> Arc<Self> {
    let supervisor = Arc::new(Supervisor {
      shutdown: Promise::new(),
      driver: Mutex::new(None),
      workers: Mutex::new(Vec::new()),
    });
    let this = supervisor.clone();
    scope
      .add_finalizer(move || async move { this.stop().await }.boxed())
      .await;
    supervisor
  }

  pub(crate) fn set_driver(&self, driver: Fiber<(), ()>) {
    *self.driver.lock() = Some(driver);
  }

  pub(crate) fn track(&self, worker: Fiber<(), ()>) {
    let mut workers = self.workers.lock();
    workers.retain(|fiber| fiber.poll().is_none());
    workers.push(worker);
  }

  async fn stop(&self) {
    self.shutdown.succeed(());
    let driver = self.driver.lock().take();
    if let Some(driver) = driver {
      let _ = driver.interrupt().await;
    }
    let workers = std::mem::take(&mut *self.workers.lock());
    trace!(workers = workers.len(), "stopping workers");
    for worker in workers {
      let _ = worker.join().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn closing_the_scope_stops_driver_and_workers() {
    let scope = Scope::new();
    let supervisor = Supervisor::new_in(&scope).await;
    let driver = Fiber::<(), ()>::fork(futures_util::future::pending());
    supervisor.set_driver(driver.clone());
    let stop = supervisor.shutdown.wait();
    let worker = Fiber::<(), ()>::fork(async move {
      stop.await;
      Ok(())
    });
    supervisor.track(worker.clone());
    tokio::time::timeout(Duration::from_secs(1), scope.close())
      .await
      .expect("scope did not close");
    assert!(matches!(driver.poll(), Some(Err(cause)) if cause.is_interrupted()));
    assert_eq!(worker.poll(), Some(Ok(())));
  }
}
