// src/runtime/scope.rs

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::trace;

type Finalizer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

enum ScopeState {
  Open(Vec<Finalizer>),
  Closed,
}

/// A region owning finalizers that run, most recent first, when the scope
/// closes. Closing twice is a no-op.
#[derive(Clone)]
pub struct Scope {
  state: Arc<Mutex<ScopeState>>,
}

impl fmt::Debug for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    let mut d = f.debug_struct("Scope");
    match &*state {
      ScopeState::Open(list) => d.field("finalizers", &list.len()),
      ScopeState::Closed => d.field("closed", &true),
    };
    d.finish()
  }
}

impl Default for Scope {
  fn default() -> Self {
    Self::new()
  }
}

impl Scope {
  pub fn new() -> Self {
    Scope {
      state: Arc::new(Mutex::new(ScopeState::Open(Vec::new()))),
    }
  }

  pub fn is_closed(&self) -> bool {
    matches!(&*self.state.lock(), ScopeState::Closed)
  }

  /// Registers a finalizer. If the scope is already closed the finalizer runs
  /// immediately.
  pub async fn add_finalizer<F>(&self, finalizer: F)
  where
    F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
  {
    let rejected = {
      let mut state = self.state.lock();
      match &mut *state {
        ScopeState::Open(list) => {
          list.push(Box::new(finalizer));
          None
        }
        ScopeState::Closed => Some(finalizer),
      }
    };
    if let Some(finalizer) = rejected {
      finalizer().await;
    }
  }

  /// Runs every registered finalizer in reverse registration order.
  pub async fn close(&self) {
    let finalizers = {
      let mut state = self.state.lock();
      match std::mem::replace(&mut *state, ScopeState::Closed) {
        ScopeState::Open(list) => list,
        ScopeState::Closed => return,
      }
    };
    trace!(count = finalizers.len(), "closing scope");
    for finalizer in finalizers.into_iter().rev() {
      finalizer().await;
    }
  }
}
