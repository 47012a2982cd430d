// src/channel/ops.rs

use crate::cause::{Cause, Exit};
use crate::channel::node::{ContinuationK, Node};
use crate::channel::Channel;
use crate::input::{AsyncInputProducer, Erased};
use crate::value::{erase, guard_effect, observe_exit, unerase, unerase_cause, unit, AnyExit, AnyValue, Data};

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

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
  /// Feeds this channel's output into `that`'s input.
  pub fn pipe_to<OutErr2, OutElem2, OutDone2>(
    self,
    that: Channel<Env, OutErr, OutElem, OutDone, OutErr2, OutElem2, OutDone2>,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem2, OutDone2>
  where
    OutErr2: Data,
    OutElem2: Data,
    OutDone2: Data,
  {
    Channel::from_node(Arc::new(Node::PipeTo {
      left: self.node,
      right: that.node,
    }))
  }

  /// Runs `on_cause` when the channel fails and `on_done` when it succeeds.
  /// Output written before either branch runs is kept.
  pub fn fold_cause_channel<OutErr2, OutDone2, H, S>(
    self,
    on_cause: H,
    on_done: S,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone2>
  where
    OutErr2: Data,
    OutDone2: Data,
    H: Fn(Cause<OutErr>) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone2> + Send + Sync + 'static,
    S: Fn(OutDone) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone2> + Send + Sync + 'static,
  {
    Channel::from_node(Arc::new(Node::Fold {
      channel: self.node,
      k: ContinuationK::new(
        Arc::new(move |value: AnyValue| on_done(unerase::<OutDone>(value)).node),
        Arc::new(move |cause: Cause<AnyValue>| on_cause(unerase_cause::<OutErr>(cause)).node),
      ),
    }))
  }

  /// Like [`fold_cause_channel`](Self::fold_cause_channel), with only typed
  /// failures reaching `on_error`.
  pub fn match_channel<OutErr2, OutDone2, H, S>(
    self,
    on_error: H,
    on_done: S,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone2>
  where
    OutErr2: Data,
    OutDone2: Data,
    H: Fn(OutErr) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone2> + Send + Sync + 'static,
    S: Fn(OutDone) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone2> + Send + Sync + 'static,
  {
    self.fold_cause_channel(
      move |cause| match cause.failure_or_cause::<OutErr2>() {
        Ok(error) => on_error(error),
        Err(cause) => Channel::fail_cause(cause),
      },
      on_done,
    )
  }

  pub fn flat_map<OutDone2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>
  where
    OutDone2: Data,
    F: Fn(OutDone) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2> + Send + Sync + 'static,
  {
    Channel::from_node(Arc::new(Node::Fold {
      channel: self.node,
      k: ContinuationK::new(
        Arc::new(move |value: AnyValue| f(unerase::<OutDone>(value)).node),
        Arc::new(Node::fail_cause),
      ),
    }))
  }

  pub fn map<OutDone2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>
  where
    OutDone2: Data,
    F: Fn(OutDone) -> OutDone2 + Send + Sync + 'static,
  {
    Channel::from_node(Arc::new(Node::Fold {
      channel: self.node,
      k: ContinuationK::new(
        Arc::new(move |value: AnyValue| Node::done_value(erase(f(unerase::<OutDone>(value))))),
        Arc::new(Node::fail_cause),
      ),
    }))
  }

  pub fn as_unit(self) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, ()> {
    self.map(|_| ())
  }

  pub fn map_error<OutErr2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone>
  where
    OutErr2: Data,
    F: Fn(OutErr) -> OutErr2 + Send + Sync + 'static,
  {
    self.map_error_cause(move |cause| cause.map(|error| f(error)))
  }

  pub fn map_error_cause<OutErr2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone>
  where
    OutErr2: Data,
    F: Fn(Cause<OutErr>) -> Cause<OutErr2> + Send + Sync + 'static,
  {
    self.fold_cause_channel(move |cause| Channel::fail_cause(f(cause)), Channel::succeed_now)
  }

  /// Recovers from typed failures. Defects and interruptions propagate.
  pub fn catch_all<OutErr2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone>
  where
    OutErr2: Data,
    F: Fn(OutErr) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone> + Send + Sync + 'static,
  {
    self.match_channel(f, Channel::succeed_now)
  }

  pub fn catch_all_cause<OutErr2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone>
  where
    OutErr2: Data,
    F: Fn(Cause<OutErr>) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone> + Send + Sync + 'static,
  {
    self.fold_cause_channel(f, Channel::succeed_now)
  }

  /// Continues with `that` when this channel fails with a typed failure.
  pub fn or_else<OutErr2>(
    self,
    that: Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone>,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr2, OutElem, OutDone>
  where
    OutErr2: Data,
  {
    self.catch_all(move |_| that.clone())
  }

  /// Runs `that` after this channel and finishes with its value.
  pub fn zip_right<OutDone2>(
    self,
    that: Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>
  where
    OutDone2: Data,
  {
    self.flat_map(move |_| that.clone())
  }

  /// Runs `that` after this channel and keeps this channel's value.
  pub fn zip_left<OutDone2>(self, that: Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>) -> Self
  where
    OutDone2: Data,
  {
    self.flat_map(move |done| that.clone().map(move |_| done.clone()))
  }

  pub fn zip<OutDone2>(
    self,
    that: Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, (OutDone, OutDone2)>
  where
    OutDone2: Data,
  {
    self.flat_map(move |done| that.clone().map(move |other| (done.clone(), other)))
  }

  /// Transforms every written element.
  pub fn map_out<OutElem2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone>
  where
    OutElem2: Data,
    F: Fn(OutElem) -> OutElem2 + Send + Sync + 'static,
  {
    fn reader<Env: Data, Err: Data, Elem: Data, Done: Data, Elem2: Data>(
      f: Arc<dyn Fn(Elem) -> Elem2 + Send + Sync>,
    ) -> Channel<Env, Err, Elem, Done, Err, Elem2, Done> {
      Channel::read_with_cause(
        move |elem| Channel::write(f(elem)).zip_right(reader(f.clone())),
        Channel::fail_cause,
        Channel::succeed_now,
      )
    }
    self.pipe_to(reader(Arc::new(f)))
  }

  /// Transforms every written element with an effect, one at a time.
  pub fn map_out_io<OutElem2, F, Fut>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone>
  where
    OutElem2: Data,
    F: Fn(OutElem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutElem2, OutErr>> + Send + 'static,
  {
    fn reader<Env: Data, Err: Data, Elem: Data, Done: Data, Elem2: Data, Fut>(
      f: Arc<dyn Fn(Elem) -> Fut + Send + Sync>,
    ) -> Channel<Env, Err, Elem, Done, Err, Elem2, Done>
    where
      Fut: Future<Output = Result<Elem2, Err>> + Send + 'static,
    {
      Channel::read_with_cause(
        move |elem: Elem| {
          let next = f.clone();
          let apply = f.clone();
          Channel::<Env, Err, Elem, Done, Err, Elem2, Elem2>::from_io(move || apply(elem.clone()))
            .flat_map(Channel::write)
            .zip_right(reader(next))
        },
        Channel::fail_cause,
        Channel::succeed_now,
      )
    }
    self.pipe_to(reader(Arc::new(f)))
  }

  /// Runs `finalizer` once the channel finished, failed or was closed.
  pub fn ensuring<F, Fut>(self, finalizer: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.ensuring_exit(move |_| finalizer())
  }

  /// Like [`ensuring`](Self::ensuring), with the channel's exit. A close
  /// requested from outside is seen as an interruption.
  pub fn ensuring_with<F, Fut>(self, finalizer: F) -> Self
  where
    F: Fn(Exit<OutErr, OutDone>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.ensuring_exit(move |exit| finalizer(observe_exit::<OutErr, OutDone>(exit)))
  }

  fn ensuring_exit<F, Fut>(self, finalizer: F) -> Self
  where
    F: Fn(&AnyExit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    Channel::from_node(Arc::new(Node::Ensuring {
      channel: self.node,
      finalizer: Arc::new(move |exit: &AnyExit| {
        let running = finalizer(exit);
        guard_effect(async move {
          running.await;
          Ok(unit())
        })
      }),
    }))
  }

  /// Satisfies the environment, leaving a channel that needs any other.
  pub fn provide<Env0: Data>(self, env: Env) -> Channel<Env0, InErr, InElem, InDone, OutErr, OutElem, OutDone> {
    Channel::from_node(Arc::new(Node::Give {
      env: Arc::new(move || erase(env.clone())),
      channel: self.node,
    }))
  }

  /// Copies whatever this channel's upstream produces into `input`; the
  /// channel itself consumes it from the other side of the cell.
  pub fn embed_input<InErr2, InElem2, InDone2, P>(
    self,
    input: P,
  ) -> Channel<Env, InErr2, InElem2, InDone2, OutErr, OutElem, OutDone>
  where
    InErr2: Data,
    InElem2: Data,
    InDone2: Data,
    P: AsyncInputProducer<InErr2, InElem2, InDone2>,
  {
    Channel::from_node(Arc::new(Node::Bridge {
      input: Arc::new(Erased::<P, InErr2, InElem2, InDone2>::new(input)),
      channel: self.node,
    }))
  }

  /// Writes nothing; finishes with every element written, paired with the
  /// terminal value.
  pub fn done_collect(self) -> Channel<Env, InErr, InElem, InDone, OutErr, Infallible, (Vec<OutElem>, OutDone)> {
    let this = self;
    Channel::defer(move || {
      let buffer: Arc<Mutex<Vec<OutElem>>> = Arc::new(Mutex::new(Vec::new()));
      this.clone().pipe_to(collector(buffer))
    })
  }

  /// Same as [`done_collect`](Self::done_collect).
  pub fn collect_elements(self) -> Channel<Env, InErr, InElem, InDone, OutErr, Infallible, (Vec<OutElem>, OutDone)> {
    self.done_collect()
  }

  /// Writes every element and the terminal value as a single element.
  pub fn emit_collect(self) -> Channel<Env, InErr, InElem, InDone, OutErr, (Vec<OutElem>, OutDone), ()> {
    self.done_collect().pipe_to(Channel::read_with_cause(
      |never: Infallible| match never {},
      Channel::fail_cause,
      Channel::write,
    ))
  }

  /// Discards every written element.
  pub fn drain(self) -> Channel<Env, InErr, InElem, InDone, OutErr, Infallible, OutDone> {
    fn discard<Env: Data, Err: Data, Elem: Data, Done: Data>() -> Channel<Env, Err, Elem, Done, Err, Infallible, Done>
    {
      Channel::read_with_cause(|_| discard(), Channel::fail_cause, Channel::succeed_now)
    }
    self.pipe_to(discard())
  }

  /// Runs the channel again every time it succeeds.
  pub fn repeated(self) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, Infallible> {
    let again = self.clone();
    self.flat_map(move |_| again.clone().repeated())
  }
}

fn collector<Env: Data, Err: Data, Elem: Data, Done: Data>(
  buffer: Arc<Mutex<Vec<Elem>>>,
) -> Channel<Env, Err, Elem, Done, Err, Infallible, (Vec<Elem>, Done)> {
  let pushed = buffer.clone();
  Channel::read_with_cause(
    move |elem| {
      pushed.lock().push(elem);
      collector(pushed.clone())
    },
    Channel::fail_cause,
    move |done| Channel::succeed_now((std::mem::take(&mut *buffer.lock()), done)),
  )
}
