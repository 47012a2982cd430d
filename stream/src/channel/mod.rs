// src/channel/mod.rs

//! The typed channel algebra.
//!
//! A [`Channel`] is an immutable description of a program that reads errors,
//! elements and a terminal value of its input protocol (`InErr`, `InElem`,
//! `InDone`), and writes those of its output protocol (`OutErr`, `OutElem`,
//! `OutDone`), given an environment `Env`. Building a channel runs nothing;
//! channels are cheap to clone and may be run any number of times.
//!
//! Internally every channel is an `Arc` of a type-erased [`node::Node`]. The
//! type parameters only exist at this surface: constructors erase values on
//! the way in and the runners in [`run`] recover them on the way out.

pub mod concat;
pub(crate) mod node;
mod ops;
mod run;

pub use concat::{ChildExecutorDecision, UpstreamPullRequest, UpstreamPullStrategy};
pub use run::Pull;

use crate::cause::{Cause, Exit};
use crate::channel::node::{ContinuationK, ErasedChannel, Node};
use crate::either::Either;
use crate::error::ChannelError;
use crate::input::AsyncInputConsumer;
use crate::runtime::Scope;
use crate::value::{
  erase, erase_cause, erase_exit, exit_shape, guard_effect, unerase, unerase_cause, unit, AnyExit, AnyValue, Data,
};

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone> {
  pub(crate) node: ErasedChannel,
  _types: PhantomData<fn(Env, InErr, InElem, InDone) -> (OutErr, OutElem, OutDone)>,
}

/// A channel that needs no environment and reads nothing.
pub type Source<OutErr, OutElem, OutDone> = Channel<(), (), (), (), OutErr, OutElem, OutDone>;

impl<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone> Clone
  for Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone>
{
  fn clone(&self) -> Self {
    Channel {
      node: self.node.clone(),
      _types: PhantomData,
    }
  }
}

impl<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone> fmt::Debug
  for Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone>
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Channel").field(&self.node.tag()).finish()
  }
}

/// A source of queue items for [`Channel::from_queue`]: elements, then one
/// terminal exit.
pub type QueueItem<OutErr, OutElem, OutDone> = Either<Exit<OutErr, OutDone>, OutElem>;

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
  pub(crate) fn from_node(node: ErasedChannel) -> Self {
    Channel {
      node,
      _types: PhantomData,
    }
  }

  /// Finishes with the value computed by `f` each time the channel runs.
  pub fn succeed<F>(f: F) -> Self
  where
    F: Fn() -> OutDone + Send + Sync + 'static,
  {
    Self::from_node(Arc::new(Node::Done(Arc::new(move || erase(f())))))
  }

  pub fn succeed_now(value: OutDone) -> Self {
    Self::from_node(Node::done_value(erase(value)))
  }

  pub fn fail(error: OutErr) -> Self {
    Self::from_node(Node::fail_cause(Cause::Fail(erase(error))))
  }

  pub fn fail_cause(cause: Cause<OutErr>) -> Self {
    Self::from_node(Node::fail_cause(erase_cause(cause)))
  }

  pub fn die(message: impl Into<String>) -> Self {
    Self::from_node(Node::fail_cause(Cause::die(message)))
  }

  pub fn from_exit(exit: Exit<OutErr, OutDone>) -> Self {
    Self::from_node(Node::from_exit(erase_exit(exit)))
  }

  /// `Left` fails, `Right` succeeds.
  pub fn from_either(either: Either<OutErr, OutDone>) -> Self {
    match either {
      Either::Left(error) => Self::fail(error),
      Either::Right(done) => Self::succeed_now(done),
    }
  }

  /// Runs the effect built by `f` and finishes with its result. `f` is called
  /// again every time the channel runs.
  pub fn from_io<F, Fut>(f: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutDone, OutErr>> + Send + 'static,
  {
    Self::from_io_exit(move || f().map(|result| result.map_err(Cause::Fail)))
  }

  /// Like [`from_io`](Self::from_io), with access to the environment.
  pub fn from_io_env<F, Fut>(f: F) -> Self
  where
    F: Fn(Env) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutDone, OutErr>> + Send + 'static,
  {
    Self::from_node(Arc::new(Node::FromIo(Arc::new(move |env: AnyValue| {
      let run = f(unerase::<Env>(env));
      guard_effect(run.map(|result| erase_exit(result.map_err(Cause::Fail))))
    }))))
  }

  /// Runs an effect that reports a full exit.
  pub fn from_io_exit<F, Fut>(f: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Exit<OutErr, OutDone>> + Send + 'static,
  {
    Self::from_node(Arc::new(Node::FromIo(Arc::new(move |_: AnyValue| {
      guard_effect(f().map(erase_exit))
    }))))
  }

  /// Builds the channel lazily, each time it runs.
  pub fn defer<F>(f: F) -> Self
  where
    F: Fn() -> Self + Send + Sync + 'static,
  {
    Self::from_node(Arc::new(Node::Defer(Arc::new(move || f().node))))
  }

  /// A channel that never finishes on its own.
  pub fn never() -> Self {
    Self::from_io_exit(future::pending::<Exit<OutErr, OutDone>>)
  }

  /// Acquires a resource, runs `use_` with it and releases it once the
  /// channel built by `use_` finished, failed or was closed. The release sees
  /// the shape of the exit it runs with.
  pub fn acquire_release_with<R, A, AFut, Rel, RelFut, U>(acquire: A, release: Rel, use_: U) -> Self
  where
    R: Data,
    A: Fn() -> AFut + Send + Sync + 'static,
    AFut: Future<Output = Result<R, OutErr>> + Send + 'static,
    Rel: Fn(R, Exit<(), ()>) -> RelFut + Send + Sync + 'static,
    RelFut: Future<Output = ()> + Send + 'static,
    U: Fn(R) -> Self + Send + Sync + 'static,
  {
    let acquire = Arc::new(acquire);
    let release = Arc::new(release);
    let use_ = Arc::new(use_);
    Self::defer(move || {
      let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
      let store = slot.clone();
      let acquire = acquire.clone();
      let use_ = use_.clone();
      let release = release.clone();
      let acquired = Channel::<Env, InErr, InElem, InDone, OutErr, OutElem, R>::from_io(move || {
        let store = store.clone();
        let acquiring = acquire();
        async move {
          let resource = acquiring.await?;
          *store.lock() = Some(resource.clone());
          Ok(resource)
        }
      });
      let body = acquired.flat_map(move |resource| use_(resource));
      Self::from_node(Arc::new(Node::Ensuring {
        channel: body.node,
        finalizer: Arc::new(move |exit: &AnyExit| {
          let shape = exit_shape(exit);
          let taken = slot.lock().take();
          let release = release.clone();
          guard_effect(async move {
            if let Some(resource) = taken {
              release(resource, shape).await;
            }
            Ok(unit())
          })
        }),
      }))
    })
  }

  /// [`acquire_release_with`](Self::acquire_release_with) for releases that
  /// do not care how the channel ended.
  pub fn acquire_release<R, A, AFut, Rel, RelFut, U>(acquire: A, release: Rel, use_: U) -> Self
  where
    R: Data,
    A: Fn() -> AFut + Send + Sync + 'static,
    AFut: Future<Output = Result<R, OutErr>> + Send + 'static,
    Rel: Fn(R) -> RelFut + Send + Sync + 'static,
    RelFut: Future<Output = ()> + Send + 'static,
    U: Fn(R) -> Self + Send + Sync + 'static,
  {
    Self::acquire_release_with(acquire, move |resource, _| release(resource), use_)
  }

  /// Runs the effect and continues as the channel it produced.
  pub fn unwrap<F, Fut>(f: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Self, OutErr>> + Send + 'static,
  {
    Channel::<Env, InErr, InElem, InDone, OutErr, OutElem, Self>::from_io(f).flat_map(|channel| channel)
  }

  /// Like [`unwrap`](Self::unwrap), with a fresh [`Scope`] that closes once
  /// the produced channel finished.
  pub fn unwrap_scoped<F, Fut>(f: F) -> Self
  where
    F: Fn(Scope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Self, OutErr>> + Send + 'static,
  {
    let f = Arc::new(f);
    Self::unwrap_scoped_env(move |scope, _env: Env| f(scope))
  }

  pub fn unwrap_scoped_env<F, Fut>(f: F) -> Self
  where
    F: Fn(Scope, Env) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Self, OutErr>> + Send + 'static,
  {
    let f = Arc::new(f);
    Self::defer(move || {
      let scope = Scope::new();
      let for_io = scope.clone();
      let f = f.clone();
      Channel::<Env, InErr, InElem, InDone, OutErr, OutElem, Self>::from_io_env(move |env| f(for_io.clone(), env))
        .flat_map(|channel| channel)
        .ensuring(move || {
          let scope = scope.clone();
          async move { scope.close().await }
        })
    })
  }

  /// Writes every element taken from `input`, then finishes with its
  /// terminal value or fails with its cause.
  pub fn from_input<C>(input: C) -> Self
  where
    C: AsyncInputConsumer<OutErr, OutElem, OutDone> + Clone,
  {
    Self::pump(Arc::new(move || {
      let take = input.take();
      async move {
        match take.await {
          Ok(elem) => Ok(Either::Right(elem)),
          Err(Either::Right(done)) => Ok(Either::Left(done)),
          Err(Either::Left(cause)) => Err(cause),
        }
      }
      .boxed()
    }))
  }

  /// Writes the elements received from `queue` until a terminal exit
  /// arrives. A queue closed before that makes the channel die.
  pub fn from_queue(queue: mpsc::Receiver<QueueItem<OutErr, OutElem, OutDone>>) -> Self {
    let queue = Arc::new(Mutex::new(queue));
    Self::pump(Arc::new(move || {
      let queue = queue.clone();
      async move {
        match future::poll_fn(|cx| queue.lock().poll_recv(cx)).await {
          Some(Either::Right(elem)) => Ok(Either::Right(elem)),
          Some(Either::Left(Ok(done))) => Ok(Either::Left(done)),
          Some(Either::Left(Err(cause))) => Err(cause),
          None => Err(Cause::die(ChannelError::QueueShutdown.to_string())),
        }
      }
      .boxed()
    }))
  }

  pub(crate) fn pump<F>(next: Arc<F>) -> Self
  where
    F: Fn() -> BoxFuture<'static, Exit<OutErr, Either<OutDone, OutElem>>> + Send + Sync + 'static,
  {
    let poll = next.clone();
    Channel::<Env, InErr, InElem, InDone, OutErr, OutElem, Either<OutDone, OutElem>>::from_io_exit(move || poll())
      .flat_map(move |step| match step {
        Either::Left(done) => Self::succeed_now(done),
        Either::Right(elem) => {
          Channel::<Env, InErr, InElem, InDone, OutErr, OutElem, ()>::write(elem).zip_right(Self::pump(next.clone()))
        }
      })
  }

  /// Reads one input element, reacting to each way the upstream can answer.
  pub fn read_with_cause<E, H, D>(in_elem: E, halt: H, done: D) -> Self
  where
    E: Fn(InElem) -> Self + Send + Sync + 'static,
    H: Fn(Cause<InErr>) -> Self + Send + Sync + 'static,
    D: Fn(InDone) -> Self + Send + Sync + 'static,
  {
    Self::from_node(Arc::new(Node::Read {
      more: Arc::new(move |value: AnyValue| in_elem(unerase::<InElem>(value)).node),
      done: ContinuationK::new(
        Arc::new(move |value: AnyValue| done(unerase::<InDone>(value)).node),
        Arc::new(move |cause: Cause<AnyValue>| halt(unerase_cause::<InErr>(cause)).node),
      ),
    }))
  }

  /// Like [`read_with_cause`](Self::read_with_cause); only typed upstream
  /// failures reach `in_err`, defects and interruptions propagate.
  pub fn read_with<E, R, D>(in_elem: E, in_err: R, done: D) -> Self
  where
    E: Fn(InElem) -> Self + Send + Sync + 'static,
    R: Fn(InErr) -> Self + Send + Sync + 'static,
    D: Fn(InDone) -> Self + Send + Sync + 'static,
  {
    Self::read_with_cause(
      in_elem,
      move |cause| match cause.failure_or_cause::<OutErr>() {
        Ok(error) => in_err(error),
        Err(cause) => Self::fail_cause(cause),
      },
      done,
    )
  }
}

impl<Env, InErr, InElem, InDone, OutErr, OutElem> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, ()>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutErr: Data,
  OutElem: Data,
{
  pub fn unit() -> Self {
    Self::succeed_now(())
  }

  /// Writes one element.
  pub fn write(elem: OutElem) -> Self {
    Self::from_node(Node::emit_value(erase(elem)))
  }

  /// Writes the elements in order.
  pub fn write_all(elems: impl IntoIterator<Item = OutElem>) -> Self {
    Self::write_from(Arc::new(elems.into_iter().collect()), 0)
  }

  fn write_from(elems: Arc<Vec<OutElem>>, at: usize) -> Self {
    match elems.get(at) {
      None => Self::unit(),
      Some(elem) => Self::write(elem.clone()).flat_map(move |_| Self::write_from(elems.clone(), at + 1)),
    }
  }

  /// Acquires a resource and writes it. `release` runs once the enclosing
  /// program finished with it.
  pub fn bracket_out<A, AFut, Rel, RelFut>(acquire: A, release: Rel) -> Self
  where
    A: Fn() -> AFut + Send + Sync + 'static,
    AFut: Future<Output = Result<OutElem, OutErr>> + Send + 'static,
    Rel: Fn(OutElem) -> RelFut + Send + Sync + 'static,
    RelFut: Future<Output = ()> + Send + 'static,
  {
    Self::bracket_out_exit(acquire, move |resource, _| release(resource))
  }

  /// Like [`bracket_out`](Self::bracket_out); `release` also sees the shape
  /// of the exit it runs with.
  pub fn bracket_out_exit<A, AFut, Rel, RelFut>(acquire: A, release: Rel) -> Self
  where
    A: Fn() -> AFut + Send + Sync + 'static,
    AFut: Future<Output = Result<OutElem, OutErr>> + Send + 'static,
    Rel: Fn(OutElem, Exit<(), ()>) -> RelFut + Send + Sync + 'static,
    RelFut: Future<Output = ()> + Send + 'static,
  {
    Self::from_node(Arc::new(Node::BracketOut {
      acquire: Arc::new(move |_: AnyValue| {
        guard_effect(acquire().map(|result| erase_exit(result.map_err(Cause::Fail))))
      }),
      release: Arc::new(move |resource: AnyValue, exit: &AnyExit| {
        let release = release(unerase::<OutElem>(resource), exit_shape(exit));
        guard_effect(async move {
          release.await;
          Ok(unit())
        })
      }),
    }))
  }
}

impl<Env, InErr, InElem, InDone, OutElem, OutDone> Channel<Env, InErr, InElem, InDone, (), OutElem, OutDone>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutElem: Data,
  OutDone: Data,
{
  /// Finishes with the value, or fails with `()` when there is none.
  pub fn from_option(option: Option<OutDone>) -> Self {
    match option {
      Some(done) => Self::succeed_now(done),
      None => Self::fail(()),
    }
  }
}

impl<Env, InErr, InElem, InDone, OutElem> Channel<Env, InErr, InElem, InDone, Option<InErr>, OutElem, InElem>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutElem: Data,
{
  /// Reads one element. Fails with `None` when the upstream finished and with
  /// `Some(error)` when it failed.
  pub fn read() -> Self {
    Self::read_with_cause(
      Self::succeed_now,
      |cause| Self::fail_cause(cause.map(Some)),
      |_| Self::fail(None),
    )
  }
}

impl<Env, InErr, InElem, InDone, OutErr, OutElem> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, InElem>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutErr: Data,
  OutElem: Data,
{
  /// Reads one element, failing with `error` if there is none.
  pub fn read_or_fail(error: OutErr) -> Self {
    let on_done = error.clone();
    Self::read_with_cause(
      Self::succeed_now,
      move |_| Self::fail(error.clone()),
      move |_| Self::fail(on_done.clone()),
    )
  }
}

impl<Env, Err, Elem, Done> Channel<Env, Err, Elem, Done, Err, Elem, Done>
where
  Env: Data,
  Err: Data,
  Elem: Data,
  Done: Data,
{
  /// Passes its input through unchanged.
  pub fn identity() -> Self {
    Self::read_with_cause(
      |elem| Channel::<Env, Err, Elem, Done, Err, Elem, ()>::write(elem).zip_right(Self::identity()),
      Self::fail_cause,
      Self::succeed_now,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::SingleProducerAsyncInput;

  use pretty_assertions::assert_eq;

  #[tokio::test]
  async fn write_all_then_done() {
    let channel = Source::<(), i32, ()>::write_all(vec![1, 2, 3]);
    let (elems, done) = channel.run_collect().await.unwrap();
    assert_eq!(elems, vec![1, 2, 3]);
    assert_eq!(done, ());
  }

  #[tokio::test]
  async fn succeed_is_lazy() {
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let channel = Source::<(), (), i32>::succeed(move || {
      *counter.lock() += 1;
      7
    });
    assert_eq!(*calls.lock(), 0);
    assert_eq!(channel.clone().run().await, Ok(7));
    assert_eq!(channel.run().await, Ok(7));
    assert_eq!(*calls.lock(), 2);
  }

  #[tokio::test]
  async fn read_fails_with_none_when_input_is_done() {
    let channel = Channel::<(), (), i32, (), Option<()>, (), i32>::read();
    assert_eq!(channel.run().await, Err(Cause::Fail(None)));
  }

  #[tokio::test]
  async fn from_input_writes_until_done() {
    let input = SingleProducerAsyncInput::<String, i32, &'static str>::new();
    let producer = input.clone();
    let feeder = tokio::spawn(async move {
      for i in 0..3 {
        producer.emit(i).await.unwrap();
      }
      producer.done("finished").unwrap();
    });
    let (elems, done) = Source::<String, i32, &'static str>::from_input(input)
      .run_collect()
      .await
      .unwrap();
    feeder.await.unwrap();
    assert_eq!(elems, vec![0, 1, 2]);
    assert_eq!(done, "finished");
  }

  #[tokio::test]
  async fn from_queue_dies_when_the_queue_closes_early() {
    let (tx, rx) = mpsc::channel::<QueueItem<(), u8, ()>>(4);
    tx.send(Either::Right(1)).await.unwrap();
    drop(tx);
    let exit = Source::<(), u8, ()>::from_queue(rx).run_collect().await;
    match exit {
      Err(cause) => assert!(cause.is_die()),
      Ok(other) => panic!("unexpected success {:?}", other),
    }
  }

  #[tokio::test]
  async fn acquire_release_releases_after_use() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (on_acquire, on_release, on_use) = (log.clone(), log.clone(), log.clone());
    let channel = Source::<(), (), u8>::acquire_release_with(
      move || {
        let log = on_acquire.clone();
        async move {
          log.lock().push("acquire");
          Ok::<_, ()>(5u8)
        }
      },
      move |_resource, exit| {
        let log = on_release.clone();
        async move {
          assert!(exit.is_ok());
          log.lock().push("release");
        }
      },
      move |resource| {
        on_use.lock().push("use");
        Source::<(), (), u8>::succeed_now(resource * 2)
      },
    );
    assert_eq!(channel.run().await, Ok(10));
    assert_eq!(*log.lock(), vec!["acquire", "use", "release"]);
  }
}
