// src/executor/subexecutor.rs

//! The stack machine behind `ConcatAll`.
//!
//! A `ConcatAll` node pulls channels out of an upstream executor and runs
//! each of them as a child executor, relaying the children's elements as its
//! own. The active frame decides what the next `run` does:
//!
//! * `PullFromUpstream` reads the next channel from upstream, or resumes a
//!   queued child.
//! * `PullFromChild` reads the next element of the running child.
//! * `DrainChildExecutors` runs the children still queued once upstream is
//!   exhausted.
//! * `Emit` emits a separator or a relayed element, then continues with the
//!   frame it wraps.
//!
//! Queues of children may contain `None` markers; a marker at the front means
//! "pull upstream (or ask `on_pull` again) before running the next child".

use crate::cause::Cause;
use crate::channel::concat::{ChildExecutorDecision, UpstreamPullRequest, UpstreamPullStrategy};
use crate::channel::node::{ConcatPolicy, OnValue};
use crate::executor::{
  sequence, ChannelExecutor, ChannelState, CloseTarget, ExecutorRef, Finalizer, Frame, Pulled, ReadRequest,
  ReadTarget, Resume,
};
use crate::value::{guard_sync, AnyExit, AnyValue, Effect};

use std::collections::VecDeque;

use tracing::trace;

pub(crate) struct PullFromUpstream {
  pub(crate) upstream: ExecutorRef,
  pub(crate) create_child: OnValue,
  pub(crate) last_done: Option<AnyValue>,
  pub(crate) active_children: VecDeque<Option<ExecutorRef>>,
  pub(crate) policy: ConcatPolicy,
}

pub(crate) struct DrainChildExecutors {
  pub(crate) upstream: ExecutorRef,
  pub(crate) last_done: Option<AnyValue>,
  pub(crate) active_children: VecDeque<Option<ExecutorRef>>,
  pub(crate) upstream_done: AnyValue,
  pub(crate) policy: ConcatPolicy,
}

/// The frame a running child returns to.
pub(crate) enum Parent {
  Upstream(PullFromUpstream),
  Drain(DrainChildExecutors),
}

pub(crate) enum Subexecutor {
  PullFromUpstream(PullFromUpstream),
  PullFromChild { child: ExecutorRef, parent: Parent },
  DrainChildExecutors(DrainChildExecutors),
  Emit { value: AnyValue, next: Box<Subexecutor> },
}

impl Parent {
  fn policy(&self) -> &ConcatPolicy {
    match self {
      Parent::Upstream(s) => &s.policy,
      Parent::Drain(s) => &s.policy,
    }
  }

  fn last_done_mut(&mut self) -> &mut Option<AnyValue> {
    match self {
      Parent::Upstream(s) => &mut s.last_done,
      Parent::Drain(s) => &mut s.last_done,
    }
  }

  fn children_mut(&mut self) -> &mut VecDeque<Option<ExecutorRef>> {
    match self {
      Parent::Upstream(s) => &mut s.active_children,
      Parent::Drain(s) => &mut s.active_children,
    }
  }
}

impl From<Parent> for Subexecutor {
  fn from(parent: Parent) -> Self {
    match parent {
      Parent::Upstream(s) => Subexecutor::PullFromUpstream(s),
      Parent::Drain(s) => Subexecutor::DrainChildExecutors(s),
    }
  }
}

fn close_children(children: VecDeque<Option<ExecutorRef>>, exit: &AnyExit) -> Vec<Effect> {
  children
    .into_iter()
    .flatten()
    .filter_map(|child| child.lock().close(exit))
    .collect()
}

impl Subexecutor {
  pub(crate) fn tag(&self) -> &'static str {
    match self {
      Subexecutor::PullFromUpstream(_) => "PullFromUpstream",
      Subexecutor::PullFromChild { .. } => "PullFromChild",
      Subexecutor::DrainChildExecutors(_) => "DrainChildExecutors",
      Subexecutor::Emit { .. } => "Emit",
    }
  }

  /// Closes every executor reachable from this frame: children before their
  /// upstream.
  pub(crate) fn close(self, exit: &AnyExit) -> Vec<Effect> {
    match self {
      Subexecutor::PullFromUpstream(s) => {
        let mut effects = close_children(s.active_children, exit);
        effects.extend(s.upstream.lock().close(exit));
        effects
      }
      Subexecutor::DrainChildExecutors(s) => {
        let mut effects = close_children(s.active_children, exit);
        effects.extend(s.upstream.lock().close(exit));
        effects
      }
      Subexecutor::PullFromChild { child, parent } => {
        let mut effects: Vec<Effect> = child.lock().close(exit).into_iter().collect();
        effects.extend(Subexecutor::from(parent).close(exit));
        effects
      }
      Subexecutor::Emit { next, .. } => next.close(exit),
    }
  }
}

impl ChannelExecutor {
  pub(super) fn run_subexecutor(&mut self) -> Option<ChannelState> {
    if let Some(close_last) = self.close_last_substream.take() {
      self.resume = Some(Resume::CloseLastSubstream);
      return Some(ChannelState::Effect(close_last));
    }
    let subexecutor = self.active_subexecutor.take()?;
    match subexecutor {
      Subexecutor::PullFromUpstream(mut s) => match s.active_children.pop_front() {
        Some(Some(child)) => {
          self.active_subexecutor = Some(Subexecutor::PullFromChild {
            child,
            parent: Parent::Upstream(s),
          });
          None
        }
        Some(None) | None => {
          let upstream = s.upstream.clone();
          self.active_subexecutor = Some(Subexecutor::PullFromUpstream(s));
          Some(ChannelState::Read(ReadRequest {
            upstream: Some(upstream),
            target: ReadTarget::SubUpstream,
          }))
        }
      },
      Subexecutor::PullFromChild { child, parent } => {
        let request = ReadRequest {
          upstream: Some(child.clone()),
          target: ReadTarget::SubChild,
        };
        self.active_subexecutor = Some(Subexecutor::PullFromChild { child, parent });
        Some(ChannelState::Read(request))
      }
      Subexecutor::DrainChildExecutors(s) => self.drain_child_executors(s),
      Subexecutor::Emit { value, next } => {
        self.emitted = Some(value.clone());
        self.active_subexecutor = Some(*next);
        Some(ChannelState::Emit(value))
      }
    }
  }

  pub(super) fn deliver_upstream(&mut self, pulled: Pulled) -> Option<ChannelState> {
    let Some(Subexecutor::PullFromUpstream(mut s)) = self.active_subexecutor.take() else {
      return None;
    };
    match pulled {
      Pulled::Emit(value) => {
        let created = guard_sync(|| {
          let channel = (s.create_child)(value.clone());
          let strategy = (s.policy.on_pull)(UpstreamPullRequest::Pulled(value));
          (channel, strategy)
        });
        let (channel, strategy) = match created {
          Ok(created) => created,
          Err(defect) => {
            let targets = vec![CloseTarget::Sub(Subexecutor::PullFromUpstream(s))];
            return self.finish_subexecutor(Err(Cause::Die(defect)), targets);
          }
        };
        let child = ChannelExecutor::new_ref(channel, self.env.clone(), self.input.clone());
        let separator = match strategy {
          UpstreamPullStrategy::PullAfterNext(separator) => {
            s.active_children.push_front(None);
            separator
          }
          UpstreamPullStrategy::PullAfterAllEnqueued(separator) => {
            s.active_children.push_back(None);
            separator
          }
        };
        let next = Subexecutor::PullFromChild {
          child,
          parent: Parent::Upstream(s),
        };
        self.active_subexecutor = Some(match separator {
          Some(value) => Subexecutor::Emit {
            value,
            next: Box::new(next),
          },
          None => next,
        });
        None
      }
      Pulled::Done(Ok(done)) => {
        let mut remaining: VecDeque<Option<ExecutorRef>> =
          s.active_children.into_iter().filter(Option::is_some).collect();
        if remaining.is_empty() {
          let combine_all = s.policy.combine_all.clone();
          let last_done = s.last_done;
          let result = guard_sync(|| combine_all(last_done, done)).map_err(Cause::Die);
          self.finish_subexecutor(result, vec![CloseTarget::Executor(s.upstream)])
        } else {
          trace!(children = remaining.len(), "upstream exhausted, draining children");
          remaining.push_back(None);
          self.active_subexecutor = Some(Subexecutor::DrainChildExecutors(DrainChildExecutors {
            upstream: s.upstream,
            last_done: s.last_done,
            active_children: remaining,
            upstream_done: done,
            policy: s.policy,
          }));
          None
        }
      }
      Pulled::Done(Err(cause)) => {
        let targets = vec![CloseTarget::Sub(Subexecutor::PullFromUpstream(s))];
        self.finish_subexecutor(Err(cause), targets)
      }
    }
  }

  pub(super) fn deliver_child(&mut self, pulled: Pulled) -> Option<ChannelState> {
    let Some(Subexecutor::PullFromChild { child, mut parent }) = self.active_subexecutor.take() else {
      return None;
    };
    match pulled {
      Pulled::Emit(value) => {
        let on_emit = parent.policy().on_emit.clone();
        let decision = match guard_sync(|| on_emit(&value)) {
          Ok(decision) => decision,
          Err(defect) => return self.fail_child(child, parent, Cause::Die(defect)),
        };
        match decision {
          ChildExecutorDecision::Continue => {
            self.active_subexecutor = Some(Subexecutor::PullFromChild { child, parent });
          }
          ChildExecutorDecision::Close(done) => {
            if let Some(state) = self.child_done(child, parent, done) {
              return Some(state);
            }
          }
          ChildExecutorDecision::Yield => {
            parent.children_mut().push_back(Some(child));
            self.active_subexecutor = Some(parent.into());
          }
        }
        let next = self.active_subexecutor.take()?;
        self.active_subexecutor = Some(Subexecutor::Emit {
          value,
          next: Box::new(next),
        });
        None
      }
      Pulled::Done(Ok(done)) => self.child_done(child, parent, done),
      Pulled::Done(Err(cause)) => self.fail_child(child, parent, cause),
    }
  }

  /// Folds a finished child's value into its parent and schedules the
  /// child's close before anything else runs.
  fn child_done(&mut self, child: ExecutorRef, mut parent: Parent, done: AnyValue) -> Option<ChannelState> {
    let combined = match parent.last_done_mut().take() {
      None => Ok(done.clone()),
      Some(previous) => {
        let combine = parent.policy().combine_inners.clone();
        let current = done.clone();
        guard_sync(move || combine(previous, current))
      }
    };
    match combined {
      Ok(value) => {
        *parent.last_done_mut() = Some(value);
        let close = child.lock().close(&Ok(done));
        let previous = self.close_last_substream.take();
        self.close_last_substream = sequence(previous.into_iter().chain(close).collect());
        self.active_subexecutor = Some(parent.into());
        None
      }
      Err(defect) => self.fail_child(child, parent, Cause::Die(defect)),
    }
  }

  fn fail_child(&mut self, child: ExecutorRef, parent: Parent, cause: Cause<AnyValue>) -> Option<ChannelState> {
    let targets = vec![CloseTarget::Executor(child), CloseTarget::Sub(parent.into())];
    self.finish_subexecutor(Err(cause), targets)
  }

  fn drain_child_executors(&mut self, mut s: DrainChildExecutors) -> Option<ChannelState> {
    match s.active_children.pop_front() {
      None => {
        let combine_all = s.policy.combine_all.clone();
        let last_done = s.last_done.take();
        let upstream_done = s.upstream_done.clone();
        let result = guard_sync(|| combine_all(last_done, upstream_done)).map_err(Cause::Die);
        self.finish_subexecutor(result, vec![CloseTarget::Executor(s.upstream)])
      }
      Some(None) => {
        let remaining = s.active_children.iter().filter(|c| c.is_some()).count();
        let on_pull = s.policy.on_pull.clone();
        let strategy = match guard_sync(|| on_pull(UpstreamPullRequest::NoUpstream(remaining))) {
          Ok(strategy) => strategy,
          Err(defect) => {
            let targets = vec![CloseTarget::Sub(Subexecutor::DrainChildExecutors(s))];
            return self.finish_subexecutor(Err(Cause::Die(defect)), targets);
          }
        };
        let separator = match strategy {
          UpstreamPullStrategy::PullAfterNext(separator) => {
            if remaining > 0 {
              let at = s.active_children.len().min(1);
              s.active_children.insert(at, None);
            }
            separator
          }
          UpstreamPullStrategy::PullAfterAllEnqueued(separator) => {
            if remaining > 0 {
              s.active_children.push_back(None);
            }
            separator
          }
        };
        self.active_subexecutor = Some(Subexecutor::DrainChildExecutors(s));
        separator.map(|value| {
          self.emitted = Some(value.clone());
          ChannelState::Emit(value)
        })
      }
      Some(Some(child)) => {
        self.active_subexecutor = Some(Subexecutor::PullFromChild {
          child,
          parent: Parent::Drain(s),
        });
        None
      }
    }
  }

  /// Leaves the stack machine with `exit`, registering the close of `targets`
  /// as a finalizer so it runs during the unwind.
  fn finish_subexecutor(&mut self, exit: AnyExit, targets: Vec<CloseTarget>) -> Option<ChannelState> {
    trace!(success = exit.is_ok(), "leaving concat-all");
    self.active_subexecutor = None;
    self.done_stack.push(Frame::Finalizer(Finalizer::Close {
      targets,
      exit: exit.clone(),
    }));
    match exit {
      Ok(value) => self.done_succeed(value),
      Err(cause) => self.done_halt(cause),
    }
  }

  /// Fails the whole stack machine, e.g. when closing a finished child
  /// failed.
  pub(super) fn abort_subexecutor(&mut self, cause: Cause<AnyValue>) -> Option<ChannelState> {
    let targets = self
      .active_subexecutor
      .take()
      .map(CloseTarget::Sub)
      .into_iter()
      .collect();
    self.finish_subexecutor(Err(cause), targets)
  }
}
