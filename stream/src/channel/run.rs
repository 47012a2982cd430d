// src/channel/run.rs

//! Running channels: to completion, or one pull at a time.

use crate::cause::{Cause, Exit, FiberId};
use crate::channel::Channel;
use crate::either::Either;
use crate::executor::{pull_step, ChannelExecutor, ExecutorRef, Step};
use crate::runtime::Scope;
use crate::value::{erase, observe_exit, unerase, unerase_cause, AnyExit, Data, Effect};

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_core::Stream;
use futures_util::{stream, FutureExt};
use tracing::{trace, warn};

struct PullState {
  exec: ExecutorRef,
  closed: AtomicBool,
}

impl PullState {
  /// Takes the executor's close effect, once. A pull that never finished is
  /// closed as interrupted.
  fn begin_close(&self) -> Option<Effect> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return None;
    }
    let mut exec = self.exec.lock();
    let exit = match exec.done() {
      Some(exit) => exit.clone(),
      None => {
        let exit: AnyExit = Err(Cause::Interrupt(FiberId::current()));
        exec.cancel_with(exit.clone());
        exit
      }
    };
    exec.close(&exit)
  }
}

impl Drop for PullState {
  fn drop(&mut self) {
    let Some(effect) = self.begin_close() else {
      return;
    };
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        trace!("closing dropped pull in the background");
        handle.spawn(effect);
      }
      Err(_) => warn!("pull dropped outside of a runtime; its finalizers did not run"),
    }
  }
}

/// A channel opened for pulling, one element at a time.
///
/// Each [`pull`](Pull::pull) runs the channel until it writes an element
/// (`Right`) or finishes (`Left` or the failure cause). Once finished, further
/// pulls keep returning the same result. [`close`](Pull::close) runs the
/// channel's finalizers; dropping the last handle without closing closes it
/// in the background. Pulls on clones of one handle must not overlap.
pub struct Pull<OutErr, OutElem, OutDone> {
  state: Arc<PullState>,
  _types: PhantomData<fn() -> (OutErr, OutElem, OutDone)>,
}

impl<OutErr, OutElem, OutDone> Clone for Pull<OutErr, OutElem, OutDone> {
  fn clone(&self) -> Self {
    Pull {
      state: self.state.clone(),
      _types: PhantomData,
    }
  }
}

impl<OutErr, OutElem, OutDone> fmt::Debug for Pull<OutErr, OutElem, OutDone> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pull")
      .field("executor", &*self.state.exec.lock())
      .field("closed", &self.state.closed.load(Ordering::Acquire))
      .finish()
  }
}

impl<OutErr: Data, OutElem: Data, OutDone: Data> Pull<OutErr, OutElem, OutDone> {
  fn new(exec: ExecutorRef) -> Self {
    Pull {
      state: Arc::new(PullState {
        exec,
        closed: AtomicBool::new(false),
      }),
      _types: PhantomData,
    }
  }

  pub async fn pull(&self) -> Result<Either<OutDone, OutElem>, Cause<OutErr>> {
    match pull_step(&self.state.exec).await {
      Step::Emit(elem) => Ok(Either::Right(unerase::<OutElem>(elem))),
      Step::Done(Ok(done)) => Ok(Either::Left(unerase::<OutDone>(done))),
      Step::Done(Err(cause)) => Err(unerase_cause::<OutErr>(cause)),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.state.closed.load(Ordering::Acquire)
  }

  /// Runs the channel's remaining finalizers. Closing twice is a no-op.
  pub async fn close(&self) -> Exit<OutErr, ()> {
    let Some(effect) = self.state.begin_close() else {
      return Ok(());
    };
    let exit = effect.await;
    if let Err(cause) = &exit {
      warn!(cause = %cause, "finalizer failed while closing");
    }
    observe_exit::<OutErr, ()>(&exit)
  }

  /// The written elements as a stream. A failure is the last item; the
  /// terminal value is discarded. The channel is closed once the stream
  /// ends.
  pub fn into_stream(self) -> impl Stream<Item = Result<OutElem, Cause<OutErr>>> + Send + 'static {
    stream::unfold(Some(self), |state| async move {
      let pull = state?;
      match pull.pull().await {
        Ok(Either::Right(elem)) => Some((Ok(elem), Some(pull))),
        Ok(Either::Left(_)) => {
          let _ = pull.close().await;
          None
        }
        Err(cause) => {
          let _ = pull.close().await;
          Some((Err(cause), None))
        }
      }
    })
  }
}

/// Combines a run's exit with the exit of closing it.
fn settle<E, A>(exit: Exit<E, A>, closed: Exit<E, ()>) -> Exit<E, A> {
  match (exit, closed) {
    (Ok(done), Ok(())) => Ok(done),
    (Ok(_), Err(cause)) | (Err(cause), Ok(())) => Err(cause),
    (Err(cause), Err(close_cause)) => Err(cause.then(close_cause)),
  }
}

impl<Env, InErr, InElem, OutErr, OutElem, OutDone> Channel<Env, InErr, InElem, (), OutErr, OutElem, OutDone>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  OutErr: Data,
  OutElem: Data,
  OutDone: Data,
{
  /// Creates an executor for driving the channel step by step with
  /// [`ChannelExecutor::run`]. Most callers want [`to_pull`](Self::to_pull).
  pub fn to_executor(&self, env: Env) -> ExecutorRef {
    ChannelExecutor::new_ref(self.node.clone(), erase(env), None)
  }

  /// Opens the channel for pulling.
  pub fn to_pull(&self, env: Env) -> Pull<OutErr, OutElem, OutDone> {
    Pull::new(self.to_executor(env))
  }

  /// Opens the channel for pulling and closes it when `scope` closes.
  pub async fn to_pull_in(&self, scope: &Scope, env: Env) -> Pull<OutErr, OutElem, OutDone> {
    let pull = self.to_pull(env);
    let handle = pull.clone();
    scope
      .add_finalizer(move || {
        async move {
          let _ = handle.close().await;
        }
        .boxed()
      })
      .await;
    pull
  }

  /// Runs the channel to completion with `env`, discarding written elements,
  /// and closes it.
  pub async fn run_with(&self, env: Env) -> Exit<OutErr, OutDone> {
    let pull = self.to_pull(env);
    let exit = loop {
      match pull.pull().await {
        Ok(Either::Right(_)) => continue,
        Ok(Either::Left(done)) => break Ok(done),
        Err(cause) => break Err(cause),
      }
    };
    let closed = pull.close().await;
    settle(exit, closed)
  }

  pub async fn run(&self) -> Exit<OutErr, OutDone>
  where
    Env: Default,
  {
    self.run_with(Env::default()).await
  }

  pub async fn run_drain(&self) -> Exit<OutErr, OutDone>
  where
    Env: Default,
  {
    self.clone().drain().run().await
  }

  /// Runs the channel, collecting every written element.
  pub async fn run_collect(&self) -> Exit<OutErr, (Vec<OutElem>, OutDone)>
  where
    Env: Default,
  {
    self.clone().done_collect().run().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::channel::Source;

  use parking_lot::Mutex;
  use pretty_assertions::assert_eq;

  #[tokio::test]
  async fn pull_round_trip_is_idempotent_after_done() {
    let channel = Source::<(), char, ()>::write_all(vec!['a', 'b', 'c']).map(|_| "end");
    let pull = channel.to_pull(());
    assert_eq!(pull.pull().await, Ok(Either::Right('a')));
    assert_eq!(pull.pull().await, Ok(Either::Right('b')));
    assert_eq!(pull.pull().await, Ok(Either::Right('c')));
    for _ in 0..3 {
      assert_eq!(pull.pull().await, Ok(Either::Left("end")));
    }
    assert_eq!(pull.close().await, Ok(()));
    assert!(pull.is_closed());
  }

  #[tokio::test]
  async fn closing_an_unfinished_pull_interrupts_it() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    let channel = Source::<(), i32, ()>::write_all(vec![1, 2, 3]).ensuring_with(move |exit| {
      let seen = seen.clone();
      async move { seen.lock().push(exit.map_err(|c| c.is_interrupted())) }
    });
    let pull = channel.to_pull(());
    assert_eq!(pull.pull().await, Ok(Either::Right(1)));
    assert_eq!(pull.close().await, Ok(()));
    assert_eq!(*log.lock(), vec![Err(true)]);
    assert!(pull.pull().await.unwrap_err().is_interrupted());
  }

  #[tokio::test]
  async fn dropped_pull_closes_in_the_background() {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let channel = Source::<(), i32, ()>::write_all(vec![1, 2]).ensuring(move || {
      let tx = tx.clone();
      async move {
        if let Some(tx) = tx.lock().take() {
          let _ = tx.send(());
        }
      }
    });
    let pull = channel.to_pull(());
    assert_eq!(pull.pull().await, Ok(Either::Right(1)));
    drop(pull);
    tokio::time::timeout(std::time::Duration::from_secs(1), rx)
      .await
      .expect("finalizer did not run")
      .unwrap();
  }

  #[tokio::test]
  async fn into_stream_ends_with_the_failure() {
    use futures_util::StreamExt;

    type Ints = Source<String, i32, ()>;
    let channel = Ints::write_all(vec![1, 2]).zip_right(Ints::fail("late".to_string()));
    let items: Vec<_> = channel.to_pull(()).into_stream().collect().await;
    assert_eq!(items, vec![Ok(1), Ok(2), Err(Cause::Fail("late".to_string()))]);
  }

  #[tokio::test]
  async fn scoped_pull_closes_with_its_scope() {
    let closed = Arc::new(Mutex::new(false));
    let flag = closed.clone();
    let channel = Source::<(), i32, ()>::write(1).ensuring(move || {
      let flag = flag.clone();
      async move { *flag.lock() = true }
    });
    let scope = Scope::new();
    let pull = channel.to_pull_in(&scope, ()).await;
    assert_eq!(pull.pull().await, Ok(Either::Right(1)));
    assert!(!*closed.lock());
    scope.close().await;
    assert!(*closed.lock());
    assert!(pull.is_closed());
  }
}
