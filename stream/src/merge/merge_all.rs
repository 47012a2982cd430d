// src/merge/merge_all.rs

use crate::channel::{Channel, QueueItem};
use crate::either::Either;
use crate::error::{ChannelError, Result};
use crate::input::SingleProducerAsyncInput;
use crate::merge::supervisor::Supervisor;
use crate::runtime::{Fiber, PermitGate, Promise, Scope};
use crate::value::Data;

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::{self, Either as Race};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const DEFAULT_BUFFER_SIZE: usize = 16;

/// What happens to a new child once `concurrency` children are running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MergeStrategy {
  /// The new child waits until a running one finished.
  #[default]
  BackPressure,
  /// The oldest outstanding child is cancelled to make room.
  BufferSliding,
}

/// Settings for [`Channel::merge_all_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergeAllConfig {
  concurrency: usize,
  buffer_size: usize,
  strategy: MergeStrategy,
}

impl MergeAllConfig {
  pub fn builder() -> MergeAllConfigBuilder {
    MergeAllConfigBuilder::default()
  }

  /// No bound on running children, default buffer and strategy.
  pub fn unbounded() -> Self {
    MergeAllConfig {
      concurrency: usize::MAX,
      buffer_size: DEFAULT_BUFFER_SIZE,
      strategy: MergeStrategy::BackPressure,
    }
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  pub fn buffer_size(&self) -> usize {
    self.buffer_size
  }

  pub fn strategy(&self) -> MergeStrategy {
    self.strategy
  }
}

/// Builds a [`MergeAllConfig`]. Concurrency must be set; the buffer holds 16
/// elements unless told otherwise.
#[derive(Debug, Clone)]
pub struct MergeAllConfigBuilder {
  concurrency: Option<usize>,
  buffer_size: usize,
  strategy: MergeStrategy,
}

impl Default for MergeAllConfigBuilder {
  fn default() -> Self {
    MergeAllConfigBuilder {
      concurrency: None,
      buffer_size: DEFAULT_BUFFER_SIZE,
      strategy: MergeStrategy::default(),
    }
  }
}

impl MergeAllConfigBuilder {
  /// Sets how many children may run at once.
  pub fn concurrency(mut self, n: usize) -> Self {
    self.concurrency = Some(n);
    self
  }

  pub fn unbounded(mut self) -> Self {
    self.concurrency = Some(usize::MAX);
    self
  }

  /// Sets how many written elements may wait for the consumer.
  pub fn buffer_size(mut self, size: usize) -> Self {
    self.buffer_size = size;
    self
  }

  pub fn strategy(mut self, strategy: MergeStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn build(self) -> Result<MergeAllConfig> {
    let concurrency = match self.concurrency {
      Some(0) => {
        return Err(ChannelError::InvalidConfig {
          field: "concurrency",
          message: "at least one child must be allowed to run".to_string(),
        })
      }
      Some(n) => n,
      None => {
        return Err(ChannelError::InvalidConfig {
          field: "concurrency",
          message: "not set".to_string(),
        })
      }
    };
    if self.buffer_size == 0 {
      return Err(ChannelError::InvalidConfig {
        field: "buffer_size",
        message: "the output buffer needs room for one element".to_string(),
      });
    }
    Ok(MergeAllConfig {
      concurrency,
      buffer_size: self.buffer_size,
      strategy: self.strategy,
    })
  }
}

type Combine<D> = Arc<dyn Fn(D, D) -> D + Send + Sync>;

fn accumulate<D>(slot: &Mutex<Option<D>>, combine: &Combine<D>, done: D) {
  let mut last = slot.lock();
  let next = match last.take() {
    Some(previous) => combine(previous, done),
    None => done,
  };
  *last = Some(next);
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
  /// Runs the channels written by `channels` concurrently, at most
  /// `config.concurrency()` at a time, writing their elements as they
  /// arrive.
  ///
  /// Terminal values of the children and finally of `channels` itself are
  /// folded with `combine`. The first failure anywhere stops every child and
  /// fails the merge.
  pub fn merge_all_with<F>(
    channels: Channel<Env, InErr, InElem, InDone, OutErr, Self, OutDone>,
    config: MergeAllConfig,
    combine: F,
  ) -> Self
  where
    F: Fn(OutDone, OutDone) -> OutDone + Send + Sync + 'static,
  {
    let combine: Combine<OutDone> = Arc::new(combine);
    Self::unwrap_scoped_env(move |scope: Scope, env: Env| {
      let channels = channels.clone();
      let combine = combine.clone();
      async move {
        let input = SingleProducerAsyncInput::<InErr, InElem, InDone>::new();
        let reader = Channel::<Env, (), (), (), InErr, InElem, InDone>::from_input(input.clone());
        let outer = reader.clone().pipe_to(channels).to_pull_in(&scope, env.clone()).await;
        let (tx, rx) = mpsc::channel::<QueueItem<OutErr, OutElem, OutDone>>(config.buffer_size);
        let supervisor = Supervisor::new_in(&scope).await;

        let n = config.concurrency;
        let gate = PermitGate::new(n);
        let error_signal = Promise::<()>::new();
        let last_done: Arc<Mutex<Option<OutDone>>> = Arc::new(Mutex::new(None));

        let tracker = supervisor.clone();
        let driver = Fiber::<(), ()>::fork(async move {
          let mut cancelers: VecDeque<Promise<()>> = VecDeque::new();
          loop {
            match outer.pull().await {
              Err(cause) => {
                let _ = tx.send(Either::Left(Err(cause))).await;
                error_signal.succeed(());
                break;
              }
              Ok(Either::Left(done)) => {
                let _all = gate.acquire_many(n).await;
                let taken = last_done.lock().take();
                let done = match taken {
                  Some(previous) => combine(previous, done),
                  None => done,
                };
                let _ = tx.send(Either::Left(Ok(done))).await;
                break;
              }
              Ok(Either::Right(channel)) => {
                let canceler = Promise::<()>::new();
                if config.strategy == MergeStrategy::BufferSliding {
                  if cancelers.len() >= n {
                    if let Some(oldest) = cancelers.pop_front() {
                      debug!("cancelling the oldest merged child");
                      oldest.succeed(());
                    }
                  }
                  cancelers.push_back(canceler.clone());
                }
                let permit = gate.acquire().await;
                let pull = reader.clone().pipe_to(channel).to_pull(env.clone());
                let signals = vec![error_signal.wait(), tracker.shutdown.wait(), canceler.wait()];
                let (tx, child_error, last_done, combine) =
                  (tx.clone(), error_signal.clone(), last_done.clone(), combine.clone());
                let child = Fiber::fork(async move {
                  let _permit = permit;
                  let evaluate = async {
                    loop {
                      match pull.pull().await {
                        Ok(Either::Right(elem)) => {
                          if tx.send(Either::Right(elem)).await.is_err() {
                            return;
                          }
                        }
                        Ok(Either::Left(done)) => return accumulate(&last_done, &combine, done),
                        Err(cause) => {
                          let _ = tx.send(Either::Left(Err(cause))).await;
                          child_error.succeed(());
                          return;
                        }
                      }
                    }
                  };
                  if let Race::Right(_) = future::select(Box::pin(evaluate), future::select_all(signals)).await {
                    trace!("merged child stopped early");
                  }
                  let _ = pull.close().await;
                  Ok(())
                });
                tracker.track(child);
                if error_signal.is_done() {
                  break;
                }
              }
            }
          }
          Ok(())
        });
        supervisor.set_driver(driver);

        Ok::<_, OutErr>(Channel::<Env, (), (), (), OutErr, OutElem, OutDone>::from_queue(rx).embed_input(input))
      }
    })
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
  pub fn merge_all(channels: Channel<Env, InErr, InElem, InDone, OutErr, Self, ()>, config: MergeAllConfig) -> Self {
    Self::merge_all_with(channels, config, |_, _| ())
  }

  pub fn merge_all_unbounded(channels: Channel<Env, InErr, InElem, InDone, OutErr, Self, ()>) -> Self {
    Self::merge_all(channels, MergeAllConfig::unbounded())
  }

  /// Maps every element to a channel and merges them.
  pub fn merge_map<OutElem2, F>(self, config: MergeAllConfig, f: F) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, ()>
  where
    OutElem2: Data,
    F: Fn(OutElem) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, ()> + Send + Sync + 'static,
  {
    Channel::merge_all(self.map_out(f), config)
  }
}

impl<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone>
  Channel<Env, InErr, InElem, InDone, OutErr, Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone>, OutDone>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutErr: Data,
  OutElem: Data,
  OutDone: Data,
{
  pub fn merge_out_with<F>(
    self,
    config: MergeAllConfig,
    combine: F,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, OutDone>
  where
    F: Fn(OutDone, OutDone) -> OutDone + Send + Sync + 'static,
  {
    Channel::merge_all_with(self, config, combine)
  }
}

impl<Env, InErr, InElem, InDone, OutErr, OutElem>
  Channel<Env, InErr, InElem, InDone, OutErr, Channel<Env, InErr, InElem, InDone, OutErr, OutElem, ()>, ()>
where
  Env: Data,
  InErr: Data,
  InElem: Data,
  InDone: Data,
  OutErr: Data,
  OutElem: Data,
{
  pub fn merge_out(self, config: MergeAllConfig) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem, ()> {
    Channel::merge_all(self, config)
  }
}
