// src/runtime/fiber.rs

use crate::cause::{Cause, Defect, Exit, FiberId};
use crate::runtime::promise::Promise;
use crate::value::Data;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::future::{self, Either};
use futures_util::FutureExt;
use tracing::debug;

/// A handle to a spawned computation whose exit can be awaited by any number
/// of parties and which can be interrupted cooperatively.
///
/// The spawned task races the computation against an interrupt signal; an
/// interrupted fiber exits with `Cause::Interrupt` naming the interruptor.
/// A panic inside the computation becomes a `Cause::Die`.
pub struct Fiber<E, A> {
  id: FiberId,
  interrupt: Promise<FiberId>,
  result: Promise<Exit<E, A>>,
}

impl<E, A> Clone for Fiber<E, A> {
  fn clone(&self) -> Self {
    Fiber {
      id: self.id,
      interrupt: self.interrupt.clone(),
      result: self.result.clone(),
    }
  }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Fiber").field("id", &self.id).finish()
  }
}

impl<E: Data, A: Data> Fiber<E, A> {
  /// Spawns `computation` on the current tokio runtime.
  pub fn fork<F>(computation: F) -> Self
  where
    F: Future<Output = Exit<E, A>> + Send + 'static,
  {
    let interrupt = Promise::<FiberId>::new();
    let result = Promise::<Exit<E, A>>::new();

    let guarded = AssertUnwindSafe(computation)
      .catch_unwind()
      .map(|r| r.unwrap_or_else(|payload| Err(Cause::Die(Defect::from_panic(payload)))));
    let signal = interrupt.wait();
    let sink = result.clone();

    let handle = tokio::spawn(async move {
      let exit = match future::select(Box::pin(guarded), signal).await {
        Either::Left((exit, _)) => exit,
        Either::Right((by, _)) => Err(Cause::Interrupt(by)),
      };
      sink.succeed(exit);
    });
    let id = FiberId::from_task(handle.id());
    debug!(fiber = %id, "forked fiber");

    Fiber { id, interrupt, result }
  }

  /// A fiber that has already exited.
  pub fn done(exit: Exit<E, A>) -> Self {
    let result = Promise::new();
    result.succeed(exit);
    Fiber {
      id: FiberId::NONE,
      interrupt: Promise::new(),
      result,
    }
  }

  pub fn id(&self) -> FiberId {
    self.id
  }

  /// Waits for the fiber to exit.
  pub async fn join(&self) -> Exit<E, A> {
    self.result.wait().await
  }

  /// The exit, if the fiber already finished.
  pub fn poll(&self) -> Option<Exit<E, A>> {
    self.result.poll_now()
  }

  /// Signals interruption without waiting for the fiber to wind down.
  pub fn interrupt_fork(&self) {
    let by = FiberId::current();
    if self.interrupt.succeed(by) {
      debug!(fiber = %self.id, by = %by, "interrupting fiber");
    }
  }

  /// Interrupts the fiber and waits for it to exit. A fiber that already
  /// finished keeps its original exit.
  pub async fn interrupt(&self) -> Exit<E, A> {
    self.interrupt_fork();
    self.join().await
  }
}
