// src/executor/mod.rs

//! The step-wise channel interpreter.
//!
//! A [`ChannelExecutor`] turns a channel AST into an externally driven state
//! machine. Each call to [`ChannelExecutor::run`] advances the program until
//! something externally visible happens and reports it as a
//! [`ChannelState`]; the executor never blocks and never awaits. The driver
//! (see [`pull_step`]) performs the requested effect or upstream read and
//! calls `run` again.

mod driver;
mod state;
pub(crate) mod subexecutor;

pub use driver::{pull_step, read_upstream, Step};
pub use state::{ChannelState, ReadRequest};

pub(crate) use driver::drain_into;
pub(crate) use state::{CloseTarget, Finalizer, Frame, Pulled, ReadTarget, Resume, Unwind};

use crate::cause::{zip_right, Cause};
use crate::channel::node::{ErasedChannel, Node};
use crate::executor::subexecutor::{PullFromUpstream, Subexecutor};
use crate::runtime::Fiber;
use crate::value::{guard_effect, guard_sync, ready, unit, AnyExit, AnyValue, Effect};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures_util::future::Shared;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::trace;

/// A shared handle to an executor. Pipes, bridges and `ConcatAll` children
/// share their upstream executors through it.
pub type ExecutorRef = Arc<Mutex<ChannelExecutor>>;

type PendingFinalizer = Box<dyn FnOnce(&AnyExit) -> Option<Effect> + Send>;

pub struct ChannelExecutor {
  current: Option<ErasedChannel>,
  env: AnyValue,
  done_stack: Vec<Frame>,
  input: Option<ExecutorRef>,
  active_subexecutor: Option<Subexecutor>,
  /// The effect last handed to the driver. Until `resume` receives its exit,
  /// every `run` hands out this same effect, so a driver that stops awaiting
  /// halfway never starts it twice.
  in_flight: Option<Shared<Effect>>,
  close_last_substream: Option<Effect>,
  emitted: Option<AnyValue>,
  done: Option<AnyExit>,
  cancelled: Option<AnyExit>,
  resume: Option<Resume>,
  /// A state produced outside of `run` (by `resume` or by delivering a read),
  /// returned by the next call to `run`.
  pending: Option<ChannelState>,
}

impl fmt::Debug for ChannelExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelExecutor")
      .field("current", &self.current.as_ref().map(|n| n.tag()))
      .field("stack_depth", &self.done_stack.len())
      .field("has_input", &self.input.is_some())
      .field("subexecutor", &self.active_subexecutor.as_ref().map(|s| s.tag()))
      .field("done", &self.done.as_ref().map(|d| d.is_ok()))
      .finish_non_exhaustive()
  }
}

impl ChannelExecutor {
  pub(crate) fn new(channel: ErasedChannel, env: AnyValue, input: Option<ExecutorRef>) -> Self {
    ChannelExecutor {
      current: Some(channel),
      env,
      done_stack: Vec::new(),
      input,
      active_subexecutor: None,
      in_flight: None,
      close_last_substream: None,
      emitted: None,
      done: None,
      cancelled: None,
      resume: None,
      pending: None,
    }
  }

  pub(crate) fn new_ref(channel: ErasedChannel, env: AnyValue, input: Option<ExecutorRef>) -> ExecutorRef {
    Arc::new(Mutex::new(Self::new(channel, env, input)))
  }

  /// The last emitted element.
  pub fn emitted(&self) -> Option<&AnyValue> {
    self.emitted.as_ref()
  }

  /// The terminal exit, once the executor finished.
  pub fn done(&self) -> Option<&AnyExit> {
    self.done.as_ref()
  }

  /// Requests that the next `run` finishes with `exit` instead of making
  /// progress.
  pub fn cancel_with(&mut self, exit: AnyExit) {
    self.cancelled = Some(exit);
  }

  /// Advances the program until it emits, finishes, or needs an effect or an
  /// upstream value.
  pub fn run(&mut self) -> ChannelState {
    loop {
      if let Some(state) = self.pending.take() {
        return self.track_effect(state);
      }
      if let Some(exit) = self.cancelled.take() {
        return self.process_cancellation(exit);
      }
      if let (Some(effect), None) = (&self.in_flight, &self.done) {
        trace!("handing out the in-flight effect again");
        return ChannelState::Effect(effect.clone().boxed());
      }
      let step = if self.active_subexecutor.is_some() {
        self.run_subexecutor()
      } else {
        match self.current.clone() {
          Some(node) => self.step(node),
          None => {
            let exit = self
              .done
              .clone()
              .unwrap_or_else(|| Err(Cause::die("channel executor ran without a program")));
            return ChannelState::Done(exit);
          }
        }
      };
      if let Some(state) = step {
        return self.track_effect(state);
      }
    }
  }

  fn track_effect(&mut self, state: ChannelState) -> ChannelState {
    match state {
      ChannelState::Effect(effect) => {
        let shared = effect.shared();
        self.in_flight = Some(shared.clone());
        ChannelState::Effect(shared.boxed())
      }
      other => other,
    }
  }

  fn process_cancellation(&mut self, exit: AnyExit) -> ChannelState {
    self.current = None;
    self.done = Some(exit.clone());
    ChannelState::Done(exit)
  }

  fn step(&mut self, node: ErasedChannel) -> Option<ChannelState> {
    match &*node {
      Node::Done(value) => match guard_sync(|| value()) {
        Ok(value) => self.done_succeed(value),
        Err(defect) => self.done_halt(Cause::Die(defect)),
      },

      Node::Fail(cause) => match guard_sync(|| cause()) {
        Ok(cause) => self.done_halt(cause),
        Err(defect) => self.done_halt(Cause::Die(defect)),
      },

      Node::FromIo(effect) => {
        let env = self.env.clone();
        let effect = guard_sync(|| effect(env)).unwrap_or_else(|defect| ready(Err(Cause::Die(defect))));
        self.resume = Some(Resume::FromIo);
        Some(ChannelState::Effect(effect))
      }

      Node::Emit(value) => match guard_sync(|| value()) {
        Ok(value) => {
          self.emitted = Some(value.clone());
          self.current = if self.active_subexecutor.is_some() {
            None
          } else {
            Some(Node::done_unit())
          };
          Some(ChannelState::Emit(value))
        }
        Err(defect) => self.done_halt(Cause::Die(defect)),
      },

      Node::Defer(make) => {
        self.current = Some(guard_sync(|| make()).unwrap_or_else(|defect| Node::fail_cause(Cause::Die(defect))));
        None
      }

      Node::Ensuring { channel, finalizer } => {
        self.done_stack.push(Frame::Finalizer(Finalizer::User(finalizer.clone())));
        self.current = Some(channel.clone());
        None
      }

      Node::BracketOut { acquire, release } => {
        let env = self.env.clone();
        let effect = guard_sync(|| acquire(env)).unwrap_or_else(|defect| ready(Err(Cause::Die(defect))));
        self.resume = Some(Resume::BracketAcquire(release.clone()));
        Some(ChannelState::Effect(effect))
      }

      Node::Give { env, channel } => match guard_sync(|| env()) {
        Ok(env) => {
          let previous = std::mem::replace(&mut self.env, env);
          self.done_stack.push(Frame::Finalizer(Finalizer::RestoreEnv(previous)));
          self.current = Some(channel.clone());
          None
        }
        Err(defect) => self.done_halt(Cause::Die(defect)),
      },

      Node::Read { .. } => Some(ChannelState::Read(ReadRequest {
        upstream: self.input.clone(),
        target: ReadTarget::Input,
      })),

      Node::Fold { channel, k } => {
        self.done_stack.push(Frame::K(k.clone()));
        self.current = Some(channel.clone());
        None
      }

      Node::PipeTo { left, right } => {
        let previous = self.input.clone();
        let left_exec = ChannelExecutor::new_ref(left.clone(), self.env.clone(), previous.clone());
        self.input = Some(left_exec);
        self.done_stack.push(Frame::Finalizer(Finalizer::RestorePipe(previous)));
        self.current = Some(right.clone());
        trace!(depth = self.done_stack.len(), "installed pipe");
        None
      }

      Node::Bridge { input, channel } => {
        match self.input.take() {
          Some(upstream) => {
            let producer = input.clone();
            let source = upstream.clone();
            let drainer = Fiber::fork(async move {
              drain_into(source, producer).await;
              Ok(())
            });
            trace!(drainer = %drainer.id(), "installed bridge");
            self.done_stack.push(Frame::Finalizer(Finalizer::Bridge {
              drainer,
              previous: Some(upstream),
            }));
          }
          // Nothing upstream: the bridged input ends right away.
          None => {
            let _ = input.done(unit());
          }
        }
        self.current = Some(channel.clone());
        None
      }

      Node::ConcatAll {
        value,
        create_child,
        policy,
      } => {
        let upstream = ChannelExecutor::new_ref(value.clone(), self.env.clone(), self.input.clone());
        self.active_subexecutor = Some(Subexecutor::PullFromUpstream(PullFromUpstream {
          upstream,
          create_child: create_child.clone(),
          last_done: None,
          active_children: VecDeque::new(),
          policy: policy.clone(),
        }));
        self.close_last_substream = None;
        self.current = None;
        trace!("entered concat-all");
        None
      }
    }
  }

  /// Hands the exit of the effect last returned by `run` back to the
  /// executor.
  pub fn resume(&mut self, exit: AnyExit) {
    self.in_flight = None;
    let Some(resume) = self.resume.take() else {
      return;
    };
    let state = match resume {
      Resume::FromIo => match exit {
        Ok(value) => self.done_succeed(value),
        Err(cause) => self.done_halt(cause),
      },
      Resume::Finalizers(unwind) => {
        match (unwind, exit) {
          (Unwind::Succeed(value), Ok(_)) => self.done_succeed(value),
          (Unwind::Succeed(_), Err(cause)) => self.done_halt(cause),
          (Unwind::Halt(cause), Ok(_)) => self.done_halt(cause),
          (Unwind::Halt(cause), Err(failure)) => self.done_halt(cause.then(failure)),
        }
      }
      Resume::BracketAcquire(release) => match exit {
        Ok(resource) => {
          self.done_stack.push(Frame::Finalizer(Finalizer::Release {
            resource: resource.clone(),
            release,
          }));
          self.current = Some(Node::emit_value(resource));
          None
        }
        Err(cause) => self.done_halt(cause),
      },
      Resume::CloseLastSubstream => match exit {
        Ok(_) => None,
        Err(cause) => self.abort_subexecutor(cause),
      },
    };
    if let Some(state) = state {
      self.pending = Some(state);
    }
  }

  /// Feeds the result of an upstream pull to whatever asked for it.
  pub(crate) fn deliver(&mut self, target: ReadTarget, pulled: Pulled) {
    let state = match target {
      ReadTarget::Input => {
        self.deliver_input(pulled);
        None
      }
      ReadTarget::SubUpstream => self.deliver_upstream(pulled),
      ReadTarget::SubChild => self.deliver_child(pulled),
    };
    if let Some(state) = state {
      self.pending = Some(state);
    }
  }

  fn deliver_input(&mut self, pulled: Pulled) {
    let Some(node) = self.current.clone() else {
      return;
    };
    if let Node::Read { more, done } = &*node {
      let next = guard_sync(|| match pulled {
        Pulled::Emit(value) => more(value),
        Pulled::Done(exit) => done.on_exit(exit),
      });
      self.current = Some(next.unwrap_or_else(|defect| Node::fail_cause(Cause::Die(defect))));
    }
  }

  pub(crate) fn done_succeed(&mut self, value: AnyValue) -> Option<ChannelState> {
    match self.done_stack.last() {
      None => {
        self.done = Some(Ok(value.clone()));
        self.current = None;
        Some(ChannelState::Done(Ok(value)))
      }
      Some(Frame::K(_)) => {
        if let Some(Frame::K(k)) = self.done_stack.pop() {
          let next = guard_sync(|| (k.on_success)(value));
          self.current = Some(next.unwrap_or_else(|defect| Node::fail_cause(Cause::Die(defect))));
        }
        None
      }
      Some(Frame::Finalizer(_)) => {
        let finalizers = self.pop_next_finalizers();
        if self.done_stack.is_empty() {
          // Left for `close`, which runs them with the final exit.
          self.restore_finalizers(finalizers);
          self.done = Some(Ok(value.clone()));
          self.current = None;
          Some(ChannelState::Done(Ok(value)))
        } else {
          let effect = self.run_finalizers(finalizers, Ok(value.clone()));
          Some(self.suspend_for_finalizers(effect, Unwind::Succeed(value)))
        }
      }
    }
  }

  pub(crate) fn done_halt(&mut self, cause: Cause<AnyValue>) -> Option<ChannelState> {
    match self.done_stack.last() {
      None => {
        self.done = Some(Err(cause.clone()));
        self.current = None;
        Some(ChannelState::Done(Err(cause)))
      }
      Some(Frame::K(_)) => {
        if let Some(Frame::K(k)) = self.done_stack.pop() {
          let next = guard_sync(|| (k.on_halt)(cause));
          self.current = Some(next.unwrap_or_else(|defect| Node::fail_cause(Cause::Die(defect))));
        }
        None
      }
      Some(Frame::Finalizer(_)) => {
        let finalizers = self.pop_next_finalizers();
        if self.done_stack.is_empty() {
          self.restore_finalizers(finalizers);
          self.done = Some(Err(cause.clone()));
          self.current = None;
          Some(ChannelState::Done(Err(cause)))
        } else {
          let effect = self.run_finalizers(finalizers, Err(cause.clone()));
          Some(self.suspend_for_finalizers(effect, Unwind::Halt(cause)))
        }
      }
    }
  }

  fn suspend_for_finalizers(&mut self, effect: Effect, unwind: Unwind) -> ChannelState {
    self.resume = Some(Resume::Finalizers(unwind));
    ChannelState::Effect(effect)
  }

  /// Pops the run of finalizer frames on top of the stack, top first.
  fn pop_next_finalizers(&mut self) -> Vec<Finalizer> {
    let mut finalizers = Vec::new();
    while matches!(self.done_stack.last(), Some(Frame::Finalizer(_))) {
      if let Some(Frame::Finalizer(finalizer)) = self.done_stack.pop() {
        finalizers.push(finalizer);
      }
    }
    finalizers
  }

  fn restore_finalizers(&mut self, finalizers: Vec<Finalizer>) {
    self
      .done_stack
      .extend(finalizers.into_iter().rev().map(Frame::Finalizer));
  }

  /// Removes every finalizer frame from the stack, top first. Fold frames are
  /// dropped: nothing continues after a close.
  fn clear_finalizers(&mut self) -> Vec<Finalizer> {
    let frames = std::mem::take(&mut self.done_stack);
    frames
      .into_iter()
      .rev()
      .filter_map(|frame| match frame {
        Frame::Finalizer(finalizer) => Some(finalizer),
        Frame::K(_) => None,
      })
      .collect()
  }

  /// Applies the synchronous part of each finalizer and returns an effect
  /// running the rest in order, combining failures sequentially.
  fn run_finalizers(&mut self, finalizers: Vec<Finalizer>, exit: AnyExit) -> Effect {
    trace!(count = finalizers.len(), "running finalizers");
    let pending: Vec<PendingFinalizer> = finalizers.into_iter().map(|f| self.prepare(f)).collect();
    guard_effect(async move {
      let mut result: AnyExit = Ok(unit());
      for finalizer in pending {
        let outcome = match guard_sync(|| finalizer(&exit)) {
          Ok(Some(effect)) => effect.await,
          Ok(None) => Ok(unit()),
          Err(defect) => Err(Cause::Die(defect)),
        };
        result = zip_right(result, outcome);
      }
      result.map(|_| unit())
    })
  }

  fn prepare(&mut self, finalizer: Finalizer) -> PendingFinalizer {
    match finalizer {
      Finalizer::User(f) => Box::new(move |exit: &AnyExit| Some(f(exit))),
      Finalizer::Release { resource, release } => Box::new(move |exit: &AnyExit| Some(release(resource, exit))),
      Finalizer::RestoreEnv(previous) => {
        self.env = previous;
        Box::new(|_: &AnyExit| None)
      }
      Finalizer::RestorePipe(previous) => {
        let installed = std::mem::replace(&mut self.input, previous);
        Box::new(move |exit: &AnyExit| installed.and_then(|left| left.lock().close(exit)))
      }
      Finalizer::Bridge { drainer, previous } => {
        self.input = previous;
        Box::new(move |_: &AnyExit| {
          Some(
            async move {
              let _ = drainer.interrupt().await;
              Ok(unit())
            }
            .boxed(),
          )
        })
      }
      Finalizer::Close { targets, exit } => Box::new(move |_: &AnyExit| {
        let effects = targets.into_iter().flat_map(|target| target.close(&exit)).collect();
        sequence(effects)
      }),
    }
  }

  /// Releases everything the executor still holds. Safe to call more than
  /// once; a later call returns `None` once everything was handed out.
  pub fn close(&mut self, exit: &AnyExit) -> Option<Effect> {
    let mut effects = Vec::new();
    if let Some(state) = self.pending.take() {
      let _ = self.track_effect(state);
    }
    if let Some(effect) = self.in_flight.take() {
      effects.extend(self.settle_in_flight(effect, exit));
    }
    if let Some(subexecutor) = self.active_subexecutor.take() {
      effects.extend(subexecutor.close(exit));
    }
    if let Some(close_last) = self.close_last_substream.take() {
      effects.push(close_last);
    }
    let finalizers = self.clear_finalizers();
    if !finalizers.is_empty() {
      effects.push(self.run_finalizers(finalizers, exit.clone()));
    }
    sequence(effects)
  }
}

impl ChannelExecutor {
  /// What closing must do about the effect the driver stopped awaiting.
  /// Acquires and finalizers run to completion, and an acquired resource is
  /// released with the close exit. A plain effect is dropped.
  fn settle_in_flight(&mut self, effect: Shared<Effect>, exit: &AnyExit) -> Option<Effect> {
    match self.resume.take() {
      Some(Resume::BracketAcquire(release)) => {
        let exit = exit.clone();
        Some(
          async move {
            match effect.await {
              Ok(resource) => match guard_sync(|| release(resource, &exit)) {
                Ok(released) => released.await,
                Err(defect) => Err(Cause::Die(defect)),
              },
              Err(_) => Ok(unit()),
            }
          }
          .boxed(),
        )
      }
      Some(Resume::Finalizers(_)) | Some(Resume::CloseLastSubstream) => Some(effect.boxed()),
      Some(Resume::FromIo) | None => {
        trace!("dropping an interrupted effect");
        None
      }
    }
  }
}

/// Runs effects one after another, keeping every failure.
pub(crate) fn sequence(effects: Vec<Effect>) -> Option<Effect> {
  match effects.len() {
    0 => None,
    1 => effects.into_iter().next(),
    _ => Some(
      async move {
        let mut result: AnyExit = Ok(unit());
        for effect in effects {
          result = zip_right(result, effect.await);
        }
        result.map(|_| unit())
      }
      .boxed(),
    ),
  }
}
