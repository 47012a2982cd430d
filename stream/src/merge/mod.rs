// src/merge/mod.rs

//! Concurrent composition.
//!
//! [`Channel::merge_with`] races two channels reading from a shared input,
//! writing whatever either side produces in arrival order. When one side
//! finishes, a caller supplied [`MergeDecision`] picks the merged terminal
//! behavior. [`Channel::merge_all_with`] fans a channel of channels in with a
//! bounded number of children running at once.

mod map_par;
mod merge_all;
mod supervisor;

pub use merge_all::{MergeAllConfig, MergeAllConfigBuilder, MergeStrategy};

use crate::cause::Exit;
use crate::channel::{Channel, Pull};
use crate::either::Either;
use crate::input::SingleProducerAsyncInput;
use crate::runtime::{Fiber, Promise, Scope};
use crate::value::Data;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, Either as Race};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

/// Finishes a merge from the exit of its remaining side.
pub type AwaitFn<E0, D0, E, D> = Arc<dyn Fn(Exit<E0, D0>) -> BoxFuture<'static, Exit<E, D>> + Send + Sync>;

/// What a merge does once one of its sides finished.
///
/// `E0`/`D0` describe the side still running, `E`/`D` the merged channel.
pub enum MergeDecision<E0, D0, E, D> {
  /// Interrupt the other side and finish with the effect's exit.
  Done(BoxFuture<'static, Exit<E, D>>),
  /// Keep writing what the other side produces, then finish with `f` of its
  /// exit.
  Await(AwaitFn<E0, D0, E, D>),
}

impl<E0, D0, E, D> fmt::Debug for MergeDecision<E0, D0, E, D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MergeDecision::Done(_) => f.write_str("MergeDecision::Done"),
      MergeDecision::Await(_) => f.write_str("MergeDecision::Await"),
    }
  }
}

impl<E0: Data, D0: Data, E: Data, D: Data> MergeDecision<E0, D0, E, D> {
  pub fn done<F>(effect: F) -> Self
  where
    F: Future<Output = Exit<E, D>> + Send + 'static,
  {
    MergeDecision::Done(effect.boxed())
  }

  pub fn done_exit(exit: Exit<E, D>) -> Self {
    Self::done(future::ready(exit))
  }

  pub fn await_with<F, Fut>(f: F) -> Self
  where
    F: Fn(Exit<E0, D0>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Exit<E, D>> + Send + 'static,
  {
    MergeDecision::Await(Arc::new(move |exit| f(exit).boxed()))
  }

  /// Waits for the other side, ignoring how it ends.
  pub fn await_const(exit: Exit<E, D>) -> Self {
    Self::await_with(move |_| future::ready(exit.clone()))
  }
}

/// Where a running merge stands.
pub enum MergeState<E1, D1, E2, D2, E, O, D> {
  /// Both sides have a pull in flight.
  BothRunning(Fiber<E1, Either<D1, O>>, Fiber<E2, Either<D2, O>>),
  /// The left side finished; the right one is drained.
  LeftDone(AwaitFn<E2, D2, E, D>),
  /// The right side finished; the left one is drained.
  RightDone(AwaitFn<E1, D1, E, D>),
}

impl<E1, D1, E2, D2, E, O, D> fmt::Debug for MergeState<E1, D1, E2, D2, E, O, D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MergeState::BothRunning(left, right) => f.debug_tuple("BothRunning").field(left).field(right).finish(),
      MergeState::LeftDone(_) => f.write_str("LeftDone"),
      MergeState::RightDone(_) => f.write_str("RightDone"),
    }
  }
}

/// The channel a merge continues as; it reads nothing itself.
type Merged<Env, E, O, D> = Channel<Env, (), (), (), E, O, D>;
type Written<Env, E, O> = Channel<Env, (), (), (), E, O, ()>;

type LeftDecide<E1, D1, E2, D2, E, D> = Arc<dyn Fn(Exit<E1, D1>) -> MergeDecision<E2, D2, E, D> + Send + Sync>;
type RightDecide<E1, D1, E2, D2, E, D> = Arc<dyn Fn(Exit<E2, D2>) -> MergeDecision<E1, D1, E, D> + Send + Sync>;

struct Merger<Env, E1, D1, E2, D2, E, O, D> {
  left: Pull<E1, O, D1>,
  right: Pull<E2, O, D2>,
  left_done: LeftDecide<E1, D1, E2, D2, E, D>,
  right_done: RightDecide<E1, D1, E2, D2, E, D>,
  left_fiber: Mutex<Option<Fiber<E1, Either<D1, O>>>>,
  right_fiber: Mutex<Option<Fiber<E2, Either<D2, O>>>>,
  _env: PhantomData<fn() -> Env>,
}

impl<Env, E1, D1, E2, D2, E, O, D> Merger<Env, E1, D1, E2, D2, E, O, D>
where
  Env: Data,
  E1: Data,
  D1: Data,
  E2: Data,
  D2: Data,
  E: Data,
  O: Data,
  D: Data,
{
  fn fork_left(&self) -> Fiber<E1, Either<D1, O>> {
    let pull = self.left.clone();
    let fiber = Fiber::fork(async move { pull.pull().await });
    *self.left_fiber.lock() = Some(fiber.clone());
    fiber
  }

  fn fork_right(&self) -> Fiber<E2, Either<D2, O>> {
    let pull = self.right.clone();
    let fiber = Fiber::fork(async move { pull.pull().await });
    *self.right_fiber.lock() = Some(fiber.clone());
    fiber
  }

  /// Interrupts whatever pulls are still in flight when `scope` closes.
  async fn watch(self: &Arc<Self>, scope: &Scope) {
    let this = self.clone();
    scope
      .add_finalizer(move || {
        async move {
          let left = this.left_fiber.lock().take();
          let right = this.right_fiber.lock().take();
          if let Some(left) = left {
            let _ = left.interrupt().await;
          }
          if let Some(right) = right {
            let _ = right.interrupt().await;
          }
        }
        .boxed()
      })
      .await;
  }

  fn go(self: &Arc<Self>, state: MergeState<E1, D1, E2, D2, E, O, D>) -> Merged<Env, E, O, D> {
    let this = self.clone();
    match state {
      MergeState::BothRunning(left, right) => Merged::unwrap(move || {
        let this = this.clone();
        let (left, right) = (left.clone(), right.clone());
        async move {
          let first = match future::select(Box::pin(left.join()), Box::pin(right.join())).await {
            Race::Left((exit, _)) => Race::Left(exit),
            Race::Right((exit, _)) => Race::Right(exit),
          };
          let next = match first {
            Race::Left(exit) => this.on_left(exit, right).await,
            Race::Right(exit) => this.on_right(exit, left).await,
          };
          Ok::<_, E>(next)
        }
      }),
      MergeState::LeftDone(finish) => Merged::unwrap(move || {
        let this = this.clone();
        let finish = finish.clone();
        async move {
          let next = match this.right.pull().await {
            Ok(Either::Right(elem)) => Written::write(elem).zip_right(this.go(MergeState::LeftDone(finish))),
            Ok(Either::Left(done)) => Merged::from_exit(finish(Ok(done)).await),
            Err(cause) => Merged::from_exit(finish(Err(cause)).await),
          };
          Ok::<_, E>(next)
        }
      }),
      MergeState::RightDone(finish) => Merged::unwrap(move || {
        let this = this.clone();
        let finish = finish.clone();
        async move {
          let next = match this.left.pull().await {
            Ok(Either::Right(elem)) => Written::write(elem).zip_right(this.go(MergeState::RightDone(finish))),
            Ok(Either::Left(done)) => Merged::from_exit(finish(Ok(done)).await),
            Err(cause) => Merged::from_exit(finish(Err(cause)).await),
          };
          Ok::<_, E>(next)
        }
      }),
    }
  }

  async fn on_left(self: Arc<Self>, exit: Exit<E1, Either<D1, O>>, right: Fiber<E2, Either<D2, O>>) -> Merged<Env, E, O, D> {
    let decision = match exit {
      Ok(Either::Right(elem)) => {
        let left = self.fork_left();
        return Written::write(elem).zip_right(self.go(MergeState::BothRunning(left, right)));
      }
      Ok(Either::Left(done)) => (self.left_done)(Ok(done)),
      Err(cause) => (self.left_done)(Err(cause)),
    };
    debug!(side = "left", decision = ?decision, "merge side finished");
    match decision {
      MergeDecision::Done(effect) => {
        let _ = right.interrupt().await;
        Merged::from_exit(effect.await)
      }
      MergeDecision::Await(finish) => match right.join().await {
        Ok(Either::Right(elem)) => Written::write(elem).zip_right(self.go(MergeState::LeftDone(finish))),
        Ok(Either::Left(done)) => Merged::from_exit(finish(Ok(done)).await),
        Err(cause) => Merged::from_exit(finish(Err(cause)).await),
      },
    }
  }

  async fn on_right(self: Arc<Self>, exit: Exit<E2, Either<D2, O>>, left: Fiber<E1, Either<D1, O>>) -> Merged<Env, E, O, D> {
    let decision = match exit {
      Ok(Either::Right(elem)) => {
        let right = self.fork_right();
        return Written::write(elem).zip_right(self.go(MergeState::BothRunning(left, right)));
      }
      Ok(Either::Left(done)) => (self.right_done)(Ok(done)),
      Err(cause) => (self.right_done)(Err(cause)),
    };
    debug!(side = "right", decision = ?decision, "merge side finished");
    match decision {
      MergeDecision::Done(effect) => {
        let _ = left.interrupt().await;
        Merged::from_exit(effect.await)
      }
      MergeDecision::Await(finish) => match left.join().await {
        Ok(Either::Right(elem)) => Written::write(elem).zip_right(self.go(MergeState::RightDone(finish))),
        Ok(Either::Left(done)) => Merged::from_exit(finish(Ok(done)).await),
        Err(cause) => Merged::from_exit(finish(Err(cause)).await),
      },
    }
  }
}

impl<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutErr: Data,
  OutElem: Data,
  OutDone: Data,
{
  /// Runs `self` and `that` concurrently, writing their elements as they
  /// arrive. Both sides share this channel's input; each upstream element
  /// reaches exactly one of them. Whichever side finishes first hands its
  /// exit to its decision function (`left_done` for `self`, `right_done` for
  /// `that`), which decides how the merge ends.
  pub fn merge_with<OutErr2, OutDone2, OutErr3, OutDone3, L, R>(
    self,
    that: Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone2>,
    left_done: L,
    right_done: R,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr3, OutElem, OutDone3>
  where
    OutErr2: Data,
    OutDone2: Data,
    OutErr3: Data,
    OutDone3: Data,
    L: Fn(Exit<OutErr, OutDone>) -> MergeDecision<OutErr2, OutDone2, OutErr3, OutDone3> + Send + Sync + 'static,
    R: Fn(Exit<OutErr2, OutDone2>) -> MergeDecision<OutErr, OutDone, OutErr3, OutDone3> + Send + Sync + 'static,
  {
    let left_done: LeftDecide<OutErr, OutDone, OutErr2, OutDone2, OutErr3, OutDone3> = Arc::new(left_done);
    let right_done: RightDecide<OutErr, OutDone, OutErr2, OutDone2, OutErr3, OutDone3> = Arc::new(right_done);
    Channel::unwrap_scoped_env(move |scope: Scope, env: Env| {
      let (this, that) = (self.clone(), that.clone());
      let (left_done, right_done) = (left_done.clone(), right_done.clone());
      async move {
        let input = SingleProducerAsyncInput::<InErr, InElem, InDone>::new();
        let reader = Channel::<Env, (), (), (), InErr, InElem, InDone>::from_input(input.clone());
        let left = reader.clone().pipe_to(this).to_pull_in(&scope, env.clone()).await;
        let right = reader.pipe_to(that).to_pull_in(&scope, env).await;
        let merger = Arc::new(Merger {
          left,
          right,
          left_done,
          right_done,
          left_fiber: Mutex::new(None),
          right_fiber: Mutex::new(None),
          _env: PhantomData,
        });
        merger.watch(&scope).await;
        let state = MergeState::BothRunning(merger.fork_left(), merger.fork_right());
        Ok::<_, OutErr3>(merger.go(state).embed_input(input))
      }
    })
  }

  /// Merges both channels until both finished, pairing their terminal
  /// values. The first failure ends the merge.
  pub fn merge<OutDone2>(
    self,
    that: Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, (OutDone, OutDone2)>
  where
    OutDone2: Data,
  {
    self.merge_with(
      that,
      |exit: Exit<OutErr, OutDone>| match exit {
        Ok(left) => MergeDecision::await_with(move |exit: Exit<OutErr, OutDone2>| {
          future::ready(exit.map(|right| (left.clone(), right)))
        }),
        Err(cause) => MergeDecision::done_exit(Err(cause)),
      },
      |exit: Exit<OutErr, OutDone2>| match exit {
        Ok(right) => MergeDecision::await_with(move |exit: Exit<OutErr, OutDone>| {
          future::ready(exit.map(|left| (left, right.clone())))
        }),
        Err(cause) => MergeDecision::done_exit(Err(cause)),
      },
    )
  }

  /// Runs the channel until the effect built by `signal` completes first,
  /// which then decides the exit. If the channel finishes first, the signal
  /// is interrupted.
  pub fn interrupt_when<F, Fut>(self, signal: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Exit<OutErr, OutDone>> + Send + 'static,
  {
    self.merge_with(
      Self::from_io_exit(signal),
      MergeDecision::done_exit,
      MergeDecision::done_exit,
    )
  }

  /// Like [`interrupt_when`](Self::interrupt_when), triggered by completing
  /// `promise`.
  pub fn interrupt_when_promise(self, promise: Promise<Exit<OutErr, OutDone>>) -> Self {
    self.interrupt_when(move || promise.wait())
  }
}
