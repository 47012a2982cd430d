// src/input.rs

//! The single-producer, multi-consumer hand-off cell used to splice an
//! independently driven producer into a channel's input.

use crate::cause::{Cause, FiberId};
use crate::either::Either;
use crate::error::Interrupted;
use crate::runtime::Promise;
use crate::value::{unerase, unerase_cause, AnyValue, Data};

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::trace;

/// What a consumer observes: an element, or the terminal state of the cell.
pub type Taken<Err, Elem, Done> = Result<Elem, Either<Cause<Err>, Done>>;

/// Producer half of an asynchronous input.
pub trait AsyncInputProducer<Err, Elem, Done>: Send + Sync + 'static {
  /// Hands `elem` to a waiting consumer, suspending until one is available.
  fn emit(&self, elem: Elem) -> BoxFuture<'static, Result<(), Interrupted>>;
  /// Publishes the terminal value.
  fn done(&self, done: Done) -> Result<(), Interrupted>;
  /// Publishes the terminal failure.
  fn error(&self, cause: Cause<Err>) -> Result<(), Interrupted>;
  /// Resolves once at least one consumer waits for a value.
  fn await_read(&self) -> BoxFuture<'static, ()>;
}

/// Consumer half of an asynchronous input.
pub trait AsyncInputConsumer<Err, Elem, Done>: Send + Sync + 'static {
  fn take(&self) -> BoxFuture<'static, Taken<Err, Elem, Done>>;
}

enum State<Err, Elem, Done> {
  /// No consumer is waiting. A producer blocks on the promise until one
  /// arrives.
  Empty(Promise<()>),
  /// Consumers waiting for the next value, oldest first. Never empty.
  Emit(VecDeque<Promise<Taken<Err, Elem, Done>>>),
  Error(Cause<Err>),
  Done(Done),
}

/// A buffer-of-one hand-off between one producer and sequential consumers.
///
/// `emit` only completes once a waiting consumer claimed the value, so a
/// producer can never run more than one element ahead of its consumers.
/// `done` and `error` take effect immediately; once the cell reached one of
/// these terminal states, every later `take` observes it and every further
/// producer operation fails with [`Interrupted`].
pub struct SingleProducerAsyncInput<Err, Elem, Done> {
  state: Arc<Mutex<State<Err, Elem, Done>>>,
}

impl<Err, Elem, Done> Clone for SingleProducerAsyncInput<Err, Elem, Done> {
  fn clone(&self) -> Self {
    Self {
      state: self.state.clone(),
    }
  }
}

impl<Err, Elem, Done> fmt::Debug for SingleProducerAsyncInput<Err, Elem, Done> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match &*self.state.lock() {
      State::Empty(_) => "empty",
      State::Emit(_) => "awaiting-producer",
      State::Error(_) => "error",
      State::Done(_) => "done",
    };
    f.debug_struct("SingleProducerAsyncInput").field("state", &label).finish()
  }
}

impl<Err: Data, Elem: Data, Done: Data> Default for SingleProducerAsyncInput<Err, Elem, Done> {
  fn default() -> Self {
    Self::new()
  }
}

impl<Err: Data, Elem: Data, Done: Data> SingleProducerAsyncInput<Err, Elem, Done> {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(State::Empty(Promise::new()))),
    }
  }

  pub async fn emit(&self, elem: Elem) -> Result<(), Interrupted> {
    loop {
      let notified = {
        let mut state = self.state.lock();
        match &mut *state {
          State::Emit(consumers) => {
            let consumer = consumers.pop_front();
            if consumers.is_empty() {
              *state = State::Empty(Promise::new());
            }
            if let Some(consumer) = consumer {
              consumer.succeed(Ok(elem));
              return Ok(());
            }
            continue;
          }
          State::Error(_) | State::Done(_) => return Err(Interrupted(FiberId::current())),
          State::Empty(notify_producer) => notify_producer.wait(),
        }
      };
      notified.await;
    }
  }

  pub fn done(&self, value: Done) -> Result<(), Interrupted> {
    self.terminate(|| Err(Either::Right(value.clone())), || State::Done(value.clone()))
  }

  pub fn error(&self, cause: Cause<Err>) -> Result<(), Interrupted> {
    self.terminate(|| Err(Either::Left(cause.clone())), || State::Error(cause.clone()))
  }

  fn terminate(
    &self,
    outcome: impl Fn() -> Taken<Err, Elem, Done>,
    terminal: impl FnOnce() -> State<Err, Elem, Done>,
  ) -> Result<(), Interrupted> {
    let mut state = self.state.lock();
    match std::mem::replace(&mut *state, terminal()) {
      State::Emit(consumers) => {
        for consumer in consumers {
          consumer.succeed(outcome());
        }
        Ok(())
      }
      State::Empty(notify_producer) => {
        // A producer parked in `emit` wakes up and sees the terminal state.
        notify_producer.succeed(());
        Ok(())
      }
      previous @ (State::Error(_) | State::Done(_)) => {
        *state = previous;
        Err(Interrupted(FiberId::current()))
      }
    }
  }

  /// Waits for the next element or the terminal state.
  pub async fn take(&self) -> Taken<Err, Elem, Done> {
    let claimed = {
      let mut state = self.state.lock();
      match &mut *state {
        State::Emit(consumers) => {
          let slot = Promise::new();
          consumers.push_back(slot.clone());
          slot.wait()
        }
        State::Error(cause) => return Err(Either::Left(cause.clone())),
        State::Done(value) => return Err(Either::Right(value.clone())),
        State::Empty(notify_producer) => {
          notify_producer.succeed(());
          let slot = Promise::new();
          let claimed = slot.wait();
          *state = State::Emit(VecDeque::from([slot]));
          claimed
        }
      }
    };
    claimed.await
  }

  pub async fn take_with<A>(
    &self,
    on_error: impl FnOnce(Cause<Err>) -> A,
    on_element: impl FnOnce(Elem) -> A,
    on_done: impl FnOnce(Done) -> A,
  ) -> A {
    match self.take().await {
      Ok(elem) => on_element(elem),
      Err(Either::Left(cause)) => on_error(cause),
      Err(Either::Right(done)) => on_done(done),
    }
  }

  /// Terminates the cell with an interruption by the calling task.
  pub fn close(&self) {
    let by = FiberId::current();
    if self.error(Cause::Interrupt(by)).is_ok() {
      trace!(by = %by, "closed hand-off cell");
    }
  }

  pub async fn await_read(&self) {
    let notified = match &*self.state.lock() {
      State::Empty(notify_producer) => notify_producer.wait(),
      _ => return,
    };
    notified.await
  }
}

impl<Err: Data, Elem: Data, Done: Data> AsyncInputProducer<Err, Elem, Done> for SingleProducerAsyncInput<Err, Elem, Done> {
  fn emit(&self, elem: Elem) -> BoxFuture<'static, Result<(), Interrupted>> {
    let this = self.clone();
    async move { SingleProducerAsyncInput::emit(&this, elem).await }.boxed()
  }

  fn done(&self, done: Done) -> Result<(), Interrupted> {
    SingleProducerAsyncInput::done(self, done)
  }

  fn error(&self, cause: Cause<Err>) -> Result<(), Interrupted> {
    SingleProducerAsyncInput::error(self, cause)
  }

  fn await_read(&self) -> BoxFuture<'static, ()> {
    let this = self.clone();
    async move { SingleProducerAsyncInput::await_read(&this).await }.boxed()
  }
}

impl<Err: Data, Elem: Data, Done: Data> AsyncInputConsumer<Err, Elem, Done> for SingleProducerAsyncInput<Err, Elem, Done> {
  fn take(&self) -> BoxFuture<'static, Taken<Err, Elem, Done>> {
    let this = self.clone();
    async move { SingleProducerAsyncInput::take(&this).await }.boxed()
  }
}

/// A producer with its payload types erased, as stored in a bridge node.
pub(crate) trait ErasedProducer: Send + Sync + 'static {
  fn emit(&self, elem: AnyValue) -> BoxFuture<'static, Result<(), Interrupted>>;
  fn done(&self, done: AnyValue) -> Result<(), Interrupted>;
  fn error(&self, cause: Cause<AnyValue>) -> Result<(), Interrupted>;
  fn await_read(&self) -> BoxFuture<'static, ()>;
}

pub(crate) struct Erased<P, Err, Elem, Done> {
  producer: P,
  _types: PhantomData<fn(Err, Elem, Done)>,
}

impl<P, Err, Elem, Done> Erased<P, Err, Elem, Done> {
  pub(crate) fn new(producer: P) -> Self {
    Self {
      producer,
      _types: PhantomData,
    }
  }
}

impl<P, Err, Elem, Done> ErasedProducer for Erased<P, Err, Elem, Done>
where
  P: AsyncInputProducer<Err, Elem, Done>,
  Err: Data,
  Elem: Data,
  Done: Data,
{
  fn emit(&self, elem: AnyValue) -> BoxFuture<'static, Result<(), Interrupted>> {
    self.producer.emit(unerase::<Elem>(elem))
  }

  fn done(&self, done: AnyValue) -> Result<(), Interrupted> {
    self.producer.done(unerase::<Done>(done))
  }

  fn error(&self, cause: Cause<AnyValue>) -> Result<(), Interrupted> {
    self.producer.error(unerase_cause::<Err>(cause))
  }

  fn await_read(&self) -> BoxFuture<'static, ()> {
    self.producer.await_read()
  }
}
