// src/runtime/permit_gate.rs

//! An async counting semaphore bounding how many children run at once.
//!
//! The gate keeps a fair (FIFO) queue of waiting tasks behind a
//! `parking_lot::Mutex`. A request for `n` permits is only granted once it is
//! at the front of the queue, so a large request (e.g. "wait until every
//! child has finished" expressed as acquiring all permits) cannot be starved
//! by a stream of small ones.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

#[derive(Debug)]
struct Waiter {
  id: u64,
  wanted: usize,
  waker: Waker,
}

#[derive(Debug)]
struct GateInternal {
  /// The number of currently available permits.
  permits: usize,
  waiters: VecDeque<Waiter>,
  next_id: u64,
}

impl GateInternal {
  fn wake_front(&self) {
    if let Some(front) = self.waiters.front() {
      if front.wanted <= self.permits {
        front.waker.wake_by_ref();
      }
    }
  }
}

/// A clonable handle to an async semaphore.
pub struct PermitGate {
  capacity: usize,
  internal: Arc<Mutex<GateInternal>>,
}

impl fmt::Debug for PermitGate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let internal = self.internal.lock();
    f.debug_struct("PermitGate")
      .field("capacity", &self.capacity)
      .field("permits", &internal.permits)
      .field("waiters", &internal.waiters.len())
      .finish()
  }
}

impl Clone for PermitGate {
  fn clone(&self) -> Self {
    Self {
      capacity: self.capacity,
      internal: self.internal.clone(),
    }
  }
}

impl PermitGate {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      internal: Arc::new(Mutex::new(GateInternal {
        permits: capacity,
        waiters: VecDeque::new(),
        next_id: 0,
      })),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn available(&self) -> usize {
    self.internal.lock().permits
  }

  /// Acquires one permit, released when the returned guard drops.
  pub fn acquire(&self) -> AcquireFuture {
    self.acquire_many(1)
  }

  /// Acquires `n` permits at once. Requests larger than the capacity are
  /// clamped to it.
  pub fn acquire_many(&self, n: usize) -> AcquireFuture {
    AcquireFuture {
      gate: self.clone(),
      wanted: n.min(self.capacity),
      id: None,
    }
  }

  /// Attempts to take a permit without waiting. Fails whenever someone is
  /// already queued so that waiters keep their priority.
  pub fn try_acquire(&self) -> Option<PermitGuard> {
    let mut internal = self.internal.lock();
    if internal.waiters.is_empty() && internal.permits > 0 {
      internal.permits -= 1;
      Some(PermitGuard {
        gate: self.clone(),
        count: 1,
      })
    } else {
      None
    }
  }

  fn release(&self, n: usize) {
    let mut internal = self.internal.lock();
    internal.permits = (internal.permits + n).min(self.capacity);
    internal.wake_front();
  }
}

/// Holds acquired permits and returns them to the gate on drop.
#[must_use = "permits are released as soon as the guard is dropped"]
pub struct PermitGuard {
  gate: PermitGate,
  count: usize,
}

impl fmt::Debug for PermitGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PermitGuard").field("count", &self.count).finish()
  }
}

impl Drop for PermitGuard {
  fn drop(&mut self) {
    if self.count > 0 {
      self.gate.release(self.count);
    }
  }
}

/// A future that resolves once the requested permits were granted.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct AcquireFuture {
  gate: PermitGate,
  wanted: usize,
  id: Option<u64>,
}

impl Future for AcquireFuture {
  type Output = PermitGuard;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    let mut internal = this.gate.internal.lock();

    match this.id {
      None => {
        // Fast path: nobody queued ahead of us.
        if internal.waiters.is_empty() && internal.permits >= this.wanted {
          internal.permits -= this.wanted;
          drop(internal);
          return Poll::Ready(PermitGuard {
            gate: this.gate.clone(),
            count: this.wanted,
          });
        }
        let id = internal.next_id;
        internal.next_id += 1;
        internal.waiters.push_back(Waiter {
          id,
          wanted: this.wanted,
          waker: cx.waker().clone(),
        });
        this.id = Some(id);
        Poll::Pending
      }
      Some(id) => {
        let at_front = internal.waiters.front().map(|w| w.id) == Some(id);
        if at_front && internal.permits >= this.wanted {
          internal.permits -= this.wanted;
          internal.waiters.pop_front();
          // The next waiter may be satisfiable with what is left.
          internal.wake_front();
          this.id = None;
          let wanted = this.wanted;
          // Mark as consumed so Drop does not touch the queue.
          this.wanted = 0;
          drop(internal);
          return Poll::Ready(PermitGuard {
            gate: this.gate.clone(),
            count: wanted,
          });
        }
        if let Some(waiter) = internal.waiters.iter_mut().find(|w| w.id == id) {
          if !waiter.waker.will_wake(cx.waker()) {
            waiter.waker = cx.waker().clone();
          }
        }
        Poll::Pending
      }
    }
  }
}

impl Drop for AcquireFuture {
  fn drop(&mut self) {
    if let Some(id) = self.id.take() {
      let mut internal = self.gate.internal.lock();
      internal.waiters.retain(|w| w.id != id);
      internal.wake_front();
    }
  }
}
