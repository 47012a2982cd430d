// src/executor/state.rs

use crate::cause::Cause;
use crate::channel::node::{ContinuationK, ExitFinalizer, ReleaseFn};
use crate::executor::subexecutor::Subexecutor;
use crate::executor::ExecutorRef;
use crate::runtime::Fiber;
use crate::value::{AnyExit, AnyValue, Effect};

use std::fmt;

/// What the driver must do after a call to [`run`](super::ChannelExecutor::run).
pub enum ChannelState {
  /// One output element is ready.
  Emit(AnyValue),
  /// The executor finished with this exit. Calling `run` again replays it.
  Done(AnyExit),
  /// The effect must be awaited and its exit handed back through
  /// [`resume`](super::ChannelExecutor::resume) before running again.
  Effect(Effect),
  /// The executor needs a value from an upstream executor. The driver hands
  /// the request to [`read_upstream`](super::read_upstream).
  Read(ReadRequest),
}

impl fmt::Debug for ChannelState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ChannelState::Emit(_) => f.write_str("Emit"),
      ChannelState::Done(exit) => f.debug_tuple("Done").field(&exit.is_ok()).finish(),
      ChannelState::Effect(_) => f.write_str("Effect"),
      ChannelState::Read(request) => f.debug_tuple("Read").field(&request.target).finish(),
    }
  }
}

/// A pending read: which upstream to pull and where the result goes.
pub struct ReadRequest {
  pub(crate) upstream: Option<ExecutorRef>,
  pub(crate) target: ReadTarget,
}

/// Which part of the reading executor consumes the pulled value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadTarget {
  /// The `Read` node currently being interpreted.
  Input,
  /// The upstream of the active `ConcatAll` frame.
  SubUpstream,
  /// The running child of the active `ConcatAll` frame.
  SubChild,
}

/// The result of pulling an upstream executor once.
pub(crate) enum Pulled {
  Emit(AnyValue),
  Done(AnyExit),
}

/// How to interpret the exit of the effect last handed to the driver.
pub(crate) enum Resume {
  FromIo,
  Finalizers(Unwind),
  BracketAcquire(ReleaseFn),
  CloseLastSubstream,
}

/// The unwind that was suspended to run finalizers.
pub(crate) enum Unwind {
  Succeed(AnyValue),
  Halt(Cause<AnyValue>),
}

pub(crate) enum Frame {
  K(ContinuationK),
  Finalizer(Finalizer),
}

/// A guaranteed-release frame. Each kind has a synchronous part applied to
/// the executor when the frame is popped and an effect run afterwards.
pub(crate) enum Finalizer {
  User(ExitFinalizer),
  Release {
    resource: AnyValue,
    release: ReleaseFn,
  },
  RestoreEnv(AnyValue),
  /// Restores the input that was current before a pipe and closes the pipe's
  /// left-hand executor.
  RestorePipe(Option<ExecutorRef>),
  /// Stops a bridge drainer and gives the drained upstream back.
  Bridge {
    drainer: Fiber<(), ()>,
    previous: Option<ExecutorRef>,
  },
  /// Closes what a finished `ConcatAll` left behind, with that frame's exit.
  Close {
    targets: Vec<CloseTarget>,
    exit: AnyExit,
  },
}

pub(crate) enum CloseTarget {
  Executor(ExecutorRef),
  Sub(Subexecutor),
}

impl CloseTarget {
  pub(crate) fn close(self, exit: &AnyExit) -> Vec<Effect> {
    match self {
      CloseTarget::Executor(exec) => exec.lock().close(exit).into_iter().collect(),
      CloseTarget::Sub(sub) => sub.close(exit),
    }
  }
}
