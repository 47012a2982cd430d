// src/executor/driver.rs

//! Drives executors from async code.

use crate::executor::{ChannelState, ExecutorRef, Pulled, ReadRequest};
use crate::input::ErasedProducer;
use crate::value::{unit, AnyExit, AnyValue};

use std::sync::Arc;

use tracing::trace;

/// One observable step of an executor.
#[derive(Debug)]
pub enum Step {
  Emit(AnyValue),
  Done(AnyExit),
}

/// Runs `exec` until it emits or finishes, performing every effect and
/// upstream read it asks for along the way.
pub async fn pull_step(exec: &ExecutorRef) -> Step {
  loop {
    let state = exec.lock().run();
    match state {
      ChannelState::Emit(value) => return Step::Emit(value),
      ChannelState::Done(exit) => return Step::Done(exit),
      ChannelState::Effect(effect) => {
        let exit = effect.await;
        exec.lock().resume(exit);
      }
      ChannelState::Read(request) => read_upstream(exec, request).await,
    }
  }
}

/// Satisfies a read issued by `reader`.
///
/// Upstream executors may themselves need to read further up, so reads are
/// resolved with an explicit work list instead of recursion: pipelines of any
/// depth use constant stack. Each entry is a reader waiting on one upstream.
/// Once the upstream emits or finishes, the result is delivered to the reader
/// and the entry below (if any) resumes pulling its own upstream.
pub async fn read_upstream(reader: &ExecutorRef, request: ReadRequest) {
  let mut work: Vec<(ExecutorRef, ReadRequest)> = vec![(reader.clone(), request)];
  while let Some((reader, request)) = work.pop() {
    let ReadRequest { upstream, target } = request;
    let Some(upstream) = upstream else {
      reader.lock().deliver(target, Pulled::Done(Ok(unit())));
      continue;
    };
    let state = upstream.lock().run();
    match state {
      ChannelState::Emit(value) => reader.lock().deliver(target, Pulled::Emit(value)),
      ChannelState::Done(exit) => reader.lock().deliver(target, Pulled::Done(exit)),
      ChannelState::Effect(effect) => {
        let exit = effect.await;
        upstream.lock().resume(exit);
        work.push((
          reader,
          ReadRequest {
            upstream: Some(upstream),
            target,
          },
        ));
      }
      ChannelState::Read(inner) => {
        work.push((
          reader,
          ReadRequest {
            upstream: Some(upstream.clone()),
            target,
          },
        ));
        work.push((upstream, inner));
      }
    }
  }
}

/// Feeds everything `upstream` produces into a bridged input, one element per
/// waiting consumer.
pub(crate) async fn drain_into(upstream: ExecutorRef, producer: Arc<dyn ErasedProducer>) {
  loop {
    producer.await_read().await;
    match pull_step(&upstream).await {
      Step::Emit(value) => {
        if producer.emit(value).await.is_err() {
          trace!("bridged input closed, drainer stopping");
          return;
        }
      }
      Step::Done(Ok(done)) => {
        let _ = producer.done(done);
        return;
      }
      Step::Done(Err(cause)) => {
        let _ = producer.error(cause);
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cause::Cause;
  use crate::channel::node::{ContinuationK, ErasedChannel, Node};
  use crate::executor::ChannelExecutor;
  use crate::value::{erase, unerase};

  use futures_util::FutureExt;

  fn emit_all(values: Vec<i32>, done: ErasedChannel) -> ErasedChannel {
    values.into_iter().rev().fold(done, |rest, v| {
      Arc::new(Node::Fold {
        channel: Node::emit_value(erase(v)),
        k: ContinuationK::new(Arc::new(move |_: AnyValue| rest.clone()), Arc::new(Node::fail_cause)),
      })
    })
  }

  /// Reads every element, emitting it times ten, and finishes with the
  /// upstream's terminal value.
  fn times_ten() -> ErasedChannel {
    Arc::new(Node::Read {
      more: Arc::new(|v: AnyValue| {
        let v = unerase::<i32>(v) * 10;
        emit_all(vec![v], Arc::new(Node::Defer(Arc::new(times_ten))))
      }),
      done: ContinuationK::new(Arc::new(Node::done_value), Arc::new(Node::fail_cause)),
    })
  }

  async fn collect(exec: &ExecutorRef) -> (Vec<i32>, AnyExit) {
    let mut seen = Vec::new();
    loop {
      match pull_step(exec).await {
        Step::Emit(v) => seen.push(unerase::<i32>(v)),
        Step::Done(exit) => return (seen, exit),
      }
    }
  }

  #[tokio::test]
  async fn pipe_feeds_right_from_left() {
    let left = emit_all(vec![1, 2, 3], Node::done_value(erase("left done")));
    let pipe = Arc::new(Node::PipeTo { left, right: times_ten() });
    let exec = ChannelExecutor::new_ref(pipe, unit(), None);
    let (seen, exit) = collect(&exec).await;
    assert_eq!(seen, vec![10, 20, 30]);
    assert_eq!(unerase::<&str>(exit.ok().unwrap()), "left done");
  }

  #[tokio::test]
  async fn deep_pipelines_read_through_every_stage() {
    let mut channel = emit_all(vec![1, 2], Node::done_value(erase(0u8)));
    for _ in 0..200 {
      channel = Arc::new(Node::PipeTo {
        left: channel,
        right: Arc::new(Node::Read {
          more: Arc::new(|v: AnyValue| emit_all(vec![unerase::<i32>(v)], Arc::new(Node::Defer(Arc::new(identity))))),
          done: ContinuationK::new(Arc::new(Node::done_value), Arc::new(Node::fail_cause)),
        }),
      });
    }
    let exec = ChannelExecutor::new_ref(channel, unit(), None);
    let (seen, exit) = collect(&exec).await;
    assert_eq!(seen, vec![1, 2]);
    assert!(exit.is_ok());
  }

  fn identity() -> ErasedChannel {
    Arc::new(Node::Read {
      more: Arc::new(|v: AnyValue| emit_all(vec![unerase::<i32>(v)], Arc::new(Node::Defer(Arc::new(identity))))),
      done: ContinuationK::new(Arc::new(Node::done_value), Arc::new(Node::fail_cause)),
    })
  }

  #[tokio::test]
  async fn read_without_upstream_sees_unit_done() {
    let exec = ChannelExecutor::new_ref(times_ten(), unit(), None);
    let (seen, exit) = collect(&exec).await;
    assert!(seen.is_empty());
    unerase::<()>(exit.ok().unwrap());
  }

  #[tokio::test]
  async fn upstream_effects_are_performed_by_the_reader() {
    let effect = Arc::new(Node::FromIo(Arc::new(|_: AnyValue| async { Ok::<_, Cause<AnyValue>>(erase(7i32)) }.boxed())));
    let left = Arc::new(Node::Fold {
      channel: effect,
      k: ContinuationK::new(
        Arc::new(|v: AnyValue| emit_all(vec![unerase::<i32>(v)], Node::done_unit())),
        Arc::new(Node::fail_cause),
      ),
    });
    let pipe = Arc::new(Node::PipeTo { left, right: times_ten() });
    let exec = ChannelExecutor::new_ref(pipe, unit(), None);
    let (seen, _) = collect(&exec).await;
    assert_eq!(seen, vec![70]);
  }

  #[tokio::test]
  async fn upstream_failure_reaches_the_reader() {
    let left = Node::fail_cause(Cause::Fail(erase("boom")));
    let pipe = Arc::new(Node::PipeTo { left, right: times_ten() });
    let exec = ChannelExecutor::new_ref(pipe, unit(), None);
    let (_, exit) = collect(&exec).await;
    match exit {
      Err(Cause::Fail(e)) => assert_eq!(unerase::<&str>(e), "boom"),
      other => panic!("unexpected exit {:?}", other.is_ok()),
    }
    let closing = exec.lock().close(&Ok(unit()));
    if let Some(effect) = closing {
      assert!(effect.await.is_ok());
    }
  }
}
