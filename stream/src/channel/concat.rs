// src/channel/concat.rs

//! Flattening: running the channels a channel produces, one after another.
//!
//! Every concatenation operator compiles to a single `ConcatAll` node whose
//! scheduling is steered by two hooks. `on_pull` decides, each time upstream
//! produced a value (or ran dry), whether the next upstream value is pulled
//! right after the new child starts or only after every queued child ran, and
//! may inject a separator element. `on_emit` looks at every element a child
//! writes and may keep the child running, close it early with a terminal
//! value, or move it behind its siblings.

use crate::channel::node::{ConcatPolicy, Node};
use crate::channel::Channel;
use crate::value::{erase, unerase, unit, AnyValue, Data};

use std::sync::Arc;

/// What `on_pull` is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamPullRequest<A> {
  /// Upstream produced this value; a child for it was just created.
  Pulled(A),
  /// Upstream is exhausted; this many children are still queued.
  NoUpstream(usize),
}

/// When to pull upstream again, and an optional separator to write first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamPullStrategy<A> {
  PullAfterNext(Option<A>),
  PullAfterAllEnqueued(Option<A>),
}

/// What to do with a child after it wrote an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildExecutorDecision<D> {
  /// Keep pulling the same child.
  Continue,
  /// Stop the child and treat it as finished with this value.
  Close(D),
  /// Queue the child behind its siblings.
  Yield,
}

impl<A> UpstreamPullRequest<A> {
  pub fn map<B>(self, f: impl FnOnce(A) -> B) -> UpstreamPullRequest<B> {
    match self {
      UpstreamPullRequest::Pulled(a) => UpstreamPullRequest::Pulled(f(a)),
      UpstreamPullRequest::NoUpstream(active) => UpstreamPullRequest::NoUpstream(active),
    }
  }
}

impl<A> UpstreamPullStrategy<A> {
  pub fn map<B>(self, f: impl FnOnce(A) -> B) -> UpstreamPullStrategy<B> {
    match self {
      UpstreamPullStrategy::PullAfterNext(separator) => UpstreamPullStrategy::PullAfterNext(separator.map(f)),
      UpstreamPullStrategy::PullAfterAllEnqueued(separator) => {
        UpstreamPullStrategy::PullAfterAllEnqueued(separator.map(f))
      }
    }
  }
}

impl<D> ChildExecutorDecision<D> {
  pub fn map<B>(self, f: impl FnOnce(D) -> B) -> ChildExecutorDecision<B> {
    match self {
      ChildExecutorDecision::Continue => ChildExecutorDecision::Continue,
      ChildExecutorDecision::Close(done) => ChildExecutorDecision::Close(f(done)),
      ChildExecutorDecision::Yield => ChildExecutorDecision::Yield,
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
  /// Runs the child built by `f` for every element, in order, writing the
  /// children's elements.
  pub fn concat_map<OutElem2, OutDone2, F>(self, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, ()>
  where
    OutElem2: Data,
    OutDone2: Data,
    F: Fn(OutElem) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone2> + Send + Sync + 'static,
  {
    let policy = ConcatPolicy {
      combine_inners: Arc::new(|_: AnyValue, _: AnyValue| unit()),
      combine_all: Arc::new(|_: Option<AnyValue>, _: AnyValue| unit()),
      on_pull: Arc::new(|_: UpstreamPullRequest<AnyValue>| UpstreamPullStrategy::PullAfterNext(None)),
      on_emit: Arc::new(|_: &AnyValue| ChildExecutorDecision::Continue),
    };
    Channel::from_node(Arc::new(Node::ConcatAll {
      value: self.node,
      create_child: Arc::new(move |elem: AnyValue| f(unerase::<OutElem>(elem)).node),
      policy,
    }))
  }

  /// Like [`concat_map`](Self::concat_map), folding the children's terminal
  /// values with `combine_inners` and the result with this channel's own
  /// terminal value with `combine_all`. When no child ran the fold starts
  /// from `OutDone2::default()`.
  pub fn concat_map_with<OutElem2, OutDone2, OutDone3, F, G, H>(
    self,
    f: F,
    combine_inners: G,
    combine_all: H,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone3>
  where
    OutElem2: Data,
    OutDone2: Data + Default,
    OutDone3: Data,
    F: Fn(OutElem) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone2> + Send + Sync + 'static,
    G: Fn(OutDone2, OutDone2) -> OutDone2 + Send + Sync + 'static,
    H: Fn(OutDone2, OutDone) -> OutDone3 + Send + Sync + 'static,
  {
    self.concat_map_with_custom(
      f,
      combine_inners,
      combine_all,
      |_| UpstreamPullStrategy::PullAfterNext(None),
      |_| ChildExecutorDecision::Continue,
    )
  }

  /// The fully configurable concatenation.
  pub fn concat_map_with_custom<OutElem2, OutDone2, OutDone3, F, G, H, P, E>(
    self,
    f: F,
    combine_inners: G,
    combine_all: H,
    on_pull: P,
    on_emit: E,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone3>
  where
    OutElem2: Data,
    OutDone2: Data + Default,
    OutDone3: Data,
    F: Fn(OutElem) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone2> + Send + Sync + 'static,
    G: Fn(OutDone2, OutDone2) -> OutDone2 + Send + Sync + 'static,
    H: Fn(OutDone2, OutDone) -> OutDone3 + Send + Sync + 'static,
    P: Fn(UpstreamPullRequest<OutElem>) -> UpstreamPullStrategy<OutElem2> + Send + Sync + 'static,
    E: Fn(&OutElem2) -> ChildExecutorDecision<OutDone2> + Send + Sync + 'static,
  {
    let policy = ConcatPolicy {
      combine_inners: Arc::new(move |left: AnyValue, right: AnyValue| {
        erase(combine_inners(unerase::<OutDone2>(left), unerase::<OutDone2>(right)))
      }),
      combine_all: Arc::new(move |inners: Option<AnyValue>, outer: AnyValue| {
        let inners = inners.map(unerase::<OutDone2>).unwrap_or_default();
        erase(combine_all(inners, unerase::<OutDone>(outer)))
      }),
      on_pull: Arc::new(move |request: UpstreamPullRequest<AnyValue>| {
        on_pull(request.map(unerase::<OutElem>)).map(|separator| erase(separator))
      }),
      on_emit: Arc::new(move |elem: &AnyValue| on_emit(&unerase::<OutElem2>(elem.clone())).map(|done| erase(done))),
    };
    Channel::from_node(Arc::new(Node::ConcatAll {
      value: self.node,
      create_child: Arc::new(move |elem: AnyValue| f(unerase::<OutElem>(elem)).node),
      policy,
    }))
  }

  /// Keeps the elements for which `keep` holds.
  pub fn filter_out<P>(self, keep: P) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, ()>
  where
    P: Fn(&OutElem) -> bool + Send + Sync + 'static,
  {
    self.concat_map(move |elem| {
      if keep(&elem) {
        Channel::<Env, InErr, InElem, InDone, OutErr, OutElem, ()>::write(elem)
      } else {
        Channel::unit()
      }
    })
  }

  /// Concatenates the channels written by `channels`, folding their terminal
  /// values like [`concat_map_with`](Self::concat_map_with).
  pub fn concat_all_with<OutDone2, OutDone0, G, H>(
    channels: Channel<
      Env,
      InErr,
      InElem,
      InDone,
      OutErr,
      Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>,
      OutDone0,
    >,
    combine_inners: G,
    combine_all: H,
  ) -> Self
  where
    OutDone2: Data + Default,
    OutDone0: Data,
    G: Fn(OutDone2, OutDone2) -> OutDone2 + Send + Sync + 'static,
    H: Fn(OutDone2, OutDone0) -> OutDone + Send + Sync + 'static,
  {
    channels.concat_map_with(|channel| channel, combine_inners, combine_all)
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
  /// Concatenates the channels written by `channels`.
  pub fn concat_all<OutDone2, OutDone0>(
    channels: Channel<
      Env,
      InErr,
      InElem,
      InDone,
      OutErr,
      Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>,
      OutDone0,
    >,
  ) -> Self
  where
    OutDone2: Data,
    OutDone0: Data,
  {
    channels.concat_map(|channel| channel)
  }
}

impl<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2, OutDone>
  Channel<Env, InErr, InElem, InDone, OutErr, Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone2>, OutDone>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutErr: Data,
  OutElem: Data,
  OutDone2: Data,
  OutDone: Data,
{
  /// Concatenates the channels this channel writes.
  pub fn concat_out(self) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, ()> {
    Channel::concat_all(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::channel::Source;

  use parking_lot::Mutex;
  use pretty_assertions::assert_eq;

  type Ints = Source<String, i32, ()>;

  #[tokio::test]
  async fn concat_map_runs_children_in_order() {
    let channel = Ints::write_all(vec![1, 2, 3]).concat_map(|x| Ints::write_all(vec![x, x * 10]));
    let (elems, ()) = channel.run_collect().await.unwrap();
    assert_eq!(elems, vec![1, 10, 2, 20, 3, 30]);
  }

  #[tokio::test]
  async fn concat_map_with_folds_terminal_values() {
    let channel = Ints::write_all(vec![1, 2, 3])
      .map(|_| "outer")
      .concat_map_with(
        |x| Ints::write(x).map(move |_| x),
        |a, b| a + b,
        |inner, outer| format!("{}:{}", outer, inner),
      );
    let (elems, done) = channel.run_collect().await.unwrap();
    assert_eq!(elems, vec![1, 2, 3]);
    assert_eq!(done, "outer:6");
  }

  #[tokio::test]
  async fn combine_all_starts_from_default_without_children() {
    let channel = Source::<String, i32, u8>::succeed_now(4).concat_map_with(
      |x: i32| Ints::write(x).map(|_| 1u32),
      |a, b| a + b,
      |inner, outer| (inner, outer),
    );
    assert_eq!(channel.run_collect().await, Ok((Vec::new(), (0u32, 4u8))));
  }

  #[tokio::test]
  async fn child_failure_closes_siblings_and_upstream() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let upstream_log = log.clone();
    let child_log = log.clone();
    let channel = Ints::write_all(vec![1, 2, 3])
      .ensuring(move || {
        let log = upstream_log.clone();
        async move { log.lock().push("upstream".to_string()) }
      })
      .concat_map(move |x| {
        let log = child_log.clone();
        let child = if x == 2 {
          Ints::fail("child 2".into())
        } else {
          Ints::write(x)
        };
        child.ensuring(move || {
          let log = log.clone();
          async move { log.lock().push(format!("child {}", x)) }
        })
      });
    let exit = channel.run_collect().await;
    assert_eq!(exit, Err(crate::cause::Cause::Fail("child 2".to_string())));
    assert_eq!(*log.lock(), vec!["child 1", "child 2", "upstream"]);
  }

  #[tokio::test]
  async fn separators_are_written_between_children() {
    let channel = Ints::write_all(vec![1, 2]).concat_map_with_custom(
      |x| Ints::write(x),
      |_: (), _: ()| (),
      |_: (), _: ()| (),
      |request| match request {
        UpstreamPullRequest::Pulled(_) => UpstreamPullStrategy::PullAfterNext(Some(0)),
        UpstreamPullRequest::NoUpstream(_) => UpstreamPullStrategy::PullAfterNext(None),
      },
      |_| ChildExecutorDecision::Continue,
    );
    let (elems, ()) = channel.run_collect().await.unwrap();
    assert_eq!(elems, vec![0, 1, 0, 2]);
  }

  #[tokio::test]
  async fn close_decision_ends_a_child_early() {
    let channel = Ints::write_all(vec![1, 2]).concat_map_with_custom(
      |x| Ints::write_all(vec![x * 10, x * 10 + 1, x * 10 + 2]).map(|_| 100),
      |a, b| a + b,
      |inner, _: ()| inner,
      |_| UpstreamPullStrategy::PullAfterNext(None),
      |elem| {
        if elem % 10 == 1 {
          ChildExecutorDecision::Close(*elem)
        } else {
          ChildExecutorDecision::Continue
        }
      },
    );
    let (elems, done) = channel.run_collect().await.unwrap();
    assert_eq!(elems, vec![10, 11, 20, 21]);
    assert_eq!(done, 11 + 21);
  }

  #[tokio::test]
  async fn yield_interleaves_children() {
    let channel = Source::<String, &'static str, ()>::write_all(vec!["a", "b"]).concat_map_with_custom(
      |name| {
        Source::<String, String, ()>::write_all(vec![format!("{}1", name), format!("{}2", name)])
      },
      |_: (), _: ()| (),
      |_: (), _: ()| (),
      |_| UpstreamPullStrategy::PullAfterAllEnqueued(None),
      |_| ChildExecutorDecision::Yield,
    );
    let (elems, ()) = channel.run_collect().await.unwrap();
    assert_eq!(elems, vec!["a1", "b1", "a2", "b2"]);
  }

  #[tokio::test]
  async fn filter_out_keeps_matching_elements() {
    let channel = Ints::write_all(1..=6).filter_out(|x| x % 2 == 0);
    let (elems, ()) = channel.run_collect().await.unwrap();
    assert_eq!(elems, vec![2, 4, 6]);
  }

  #[test]
  fn policy_enums_map_their_payloads() {
    assert_eq!(UpstreamPullRequest::Pulled(2).map(|x| x * 2), UpstreamPullRequest::Pulled(4));
    assert_eq!(
      UpstreamPullRequest::<i32>::NoUpstream(3).map(|x| x * 2),
      UpstreamPullRequest::NoUpstream(3)
    );
    assert_eq!(
      UpstreamPullStrategy::PullAfterNext(Some("a")).map(str::len),
      UpstreamPullStrategy::PullAfterNext(Some(1))
    );
    assert_eq!(ChildExecutorDecision::Close(1).map(|x| x + 1), ChildExecutorDecision::Close(2));
  }
}
