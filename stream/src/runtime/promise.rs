// src/runtime/promise.rs

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// The internal, mutex-protected core of a `Promise`.
struct Inner<T> {
  value: Option<T>,
  waiters: VecDeque<Waker>,
}

/// A single-assignment cell that any number of tasks can await.
///
/// The first `succeed` wins; later attempts are rejected and return `false`.
/// Every waiter (present or future) observes a clone of the stored value.
pub struct Promise<T> {
  inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Promise {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> fmt::Debug for Promise<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("Promise")
      .field("done", &inner.value.is_some())
      .field("waiters", &inner.waiters.len())
      .finish()
  }
}

impl<T: Clone + Send> Default for Promise<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send> Promise<T> {
  pub fn new() -> Self {
    Promise {
      inner: Arc::new(Mutex::new(Inner {
        value: None,
        waiters: VecDeque::new(),
      })),
    }
  }

  /// Completes the promise, waking all waiters. Returns `false` if it was
  /// already completed.
  pub fn succeed(&self, value: T) -> bool {
    let waiters = {
      let mut inner = self.inner.lock();
      if inner.value.is_some() {
        return false;
      }
      inner.value = Some(value);
      std::mem::take(&mut inner.waiters)
    };
    for waker in waiters {
      waker.wake();
    }
    true
  }

  pub fn is_done(&self) -> bool {
    self.inner.lock().value.is_some()
  }

  /// Returns the value if the promise is already completed.
  pub fn poll_now(&self) -> Option<T> {
    self.inner.lock().value.clone()
  }

  /// Returns a future resolving to the promised value. The future owns a
  /// handle to the promise and can be moved into spawned tasks.
  pub fn wait(&self) -> Wait<T> {
    Wait {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Future returned by [`Promise::wait`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct Wait<T> {
  inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone> Future for Wait<T> {
  type Output = T;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.inner.lock();
    match &inner.value {
      Some(value) => Poll::Ready(value.clone()),
      None => {
        if !inner.waiters.iter().any(|w| w.will_wake(cx.waker())) {
          inner.waiters.push_back(cx.waker().clone());
        }
        Poll::Pending
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::time::timeout;

  #[tokio::test]
  async fn first_succeed_wins() {
    let p = Promise::new();
    assert!(p.succeed(1));
    assert!(!p.succeed(2));
    assert_eq!(p.wait().await, 1);
    assert_eq!(p.poll_now(), Some(1));
  }

  #[tokio::test]
  async fn all_waiters_are_woken() {
    let p = Promise::<&'static str>::new();
    let mut handles = Vec::new();
    for _ in 0..4 {
      let w = p.wait();
      handles.push(tokio::spawn(w));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    p.succeed("go");
    for h in handles {
      let v = timeout(Duration::from_secs(1), h).await.expect("waiter hung").unwrap();
      assert_eq!(v, "go");
    }
  }
}
