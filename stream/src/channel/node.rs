// src/channel/node.rs

//! The type-erased channel AST walked by the executor.

use crate::cause::Cause;
use crate::channel::concat::{ChildExecutorDecision, UpstreamPullRequest, UpstreamPullStrategy};
use crate::input::ErasedProducer;
use crate::value::{unit, AnyExit, AnyValue, Effect};

use std::fmt;
use std::sync::Arc;

pub(crate) type ErasedChannel = Arc<Node>;

pub(crate) type ValueThunk = Arc<dyn Fn() -> AnyValue + Send + Sync>;
pub(crate) type CauseThunk = Arc<dyn Fn() -> Cause<AnyValue> + Send + Sync>;
pub(crate) type EnvEffect = Arc<dyn Fn(AnyValue) -> Effect + Send + Sync>;
pub(crate) type ExitFinalizer = Arc<dyn Fn(&AnyExit) -> Effect + Send + Sync>;
pub(crate) type ReleaseFn = Arc<dyn Fn(AnyValue, &AnyExit) -> Effect + Send + Sync>;
pub(crate) type OnValue = Arc<dyn Fn(AnyValue) -> ErasedChannel + Send + Sync>;
pub(crate) type OnCause = Arc<dyn Fn(Cause<AnyValue>) -> ErasedChannel + Send + Sync>;

/// A fold frame: what to run once the channel below it finished.
#[derive(Clone)]
pub(crate) struct ContinuationK {
  pub(crate) on_success: OnValue,
  pub(crate) on_halt: OnCause,
}

impl ContinuationK {
  pub(crate) fn new(on_success: OnValue, on_halt: OnCause) -> Self {
    Self { on_success, on_halt }
  }

  pub(crate) fn on_exit(&self, exit: AnyExit) -> ErasedChannel {
    match exit {
      Ok(value) => (self.on_success)(value),
      Err(cause) => (self.on_halt)(cause),
    }
  }
}

/// Scheduling hooks and result combiners of a `ConcatAll` node.
#[derive(Clone)]
pub(crate) struct ConcatPolicy {
  pub(crate) combine_inners: Arc<dyn Fn(AnyValue, AnyValue) -> AnyValue + Send + Sync>,
  pub(crate) combine_all: Arc<dyn Fn(Option<AnyValue>, AnyValue) -> AnyValue + Send + Sync>,
  pub(crate) on_pull: Arc<dyn Fn(UpstreamPullRequest<AnyValue>) -> UpstreamPullStrategy<AnyValue> + Send + Sync>,
  pub(crate) on_emit: Arc<dyn Fn(&AnyValue) -> ChildExecutorDecision<AnyValue> + Send + Sync>,
}

pub(crate) enum Node {
  Done(ValueThunk),
  Fail(CauseThunk),
  FromIo(EnvEffect),
  Emit(ValueThunk),
  Defer(Arc<dyn Fn() -> ErasedChannel + Send + Sync>),
  Ensuring {
    channel: ErasedChannel,
    finalizer: ExitFinalizer,
  },
  BracketOut {
    acquire: EnvEffect,
    release: ReleaseFn,
  },
  Give {
    env: ValueThunk,
    channel: ErasedChannel,
  },
  Read {
    more: OnValue,
    done: ContinuationK,
  },
  Fold {
    channel: ErasedChannel,
    k: ContinuationK,
  },
  PipeTo {
    left: ErasedChannel,
    right: ErasedChannel,
  },
  Bridge {
    input: Arc<dyn ErasedProducer>,
    channel: ErasedChannel,
  },
  ConcatAll {
    value: ErasedChannel,
    create_child: OnValue,
    policy: ConcatPolicy,
  },
}

impl Node {
  pub(crate) fn tag(&self) -> &'static str {
    match self {
      Node::Done(_) => "Done",
      Node::Fail(_) => "Fail",
      Node::FromIo(_) => "FromIo",
      Node::Emit(_) => "Emit",
      Node::Defer(_) => "Defer",
      Node::Ensuring { .. } => "Ensuring",
      Node::BracketOut { .. } => "BracketOut",
      Node::Give { .. } => "Give",
      Node::Read { .. } => "Read",
      Node::Fold { .. } => "Fold",
      Node::PipeTo { .. } => "PipeTo",
      Node::Bridge { .. } => "Bridge",
      Node::ConcatAll { .. } => "ConcatAll",
    }
  }

  pub(crate) fn done_value(value: AnyValue) -> ErasedChannel {
    Arc::new(Node::Done(Arc::new(move || value.clone())))
  }

  pub(crate) fn done_unit() -> ErasedChannel {
    Arc::new(Node::Done(Arc::new(unit)))
  }

  pub(crate) fn emit_value(value: AnyValue) -> ErasedChannel {
    Arc::new(Node::Emit(Arc::new(move || value.clone())))
  }

  pub(crate) fn fail_cause(cause: Cause<AnyValue>) -> ErasedChannel {
    Arc::new(Node::Fail(Arc::new(move || cause.clone())))
  }

  pub(crate) fn from_exit(exit: AnyExit) -> ErasedChannel {
    match exit {
      Ok(value) => Node::done_value(value),
      Err(cause) => Node::fail_cause(cause),
    }
  }
}

impl fmt::Debug for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.tag())
  }
}
