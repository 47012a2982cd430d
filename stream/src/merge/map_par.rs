// src/merge/map_par.rs

use crate::cause::{Cause, Defect, Exit, FiberId};
use crate::channel::Channel;
use crate::either::Either;
use crate::error::ChannelError;
use crate::input::SingleProducerAsyncInput;
use crate::merge::supervisor::Supervisor;
use crate::runtime::{Fiber, PermitGate, Promise, Scope};
use crate::value::Data;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{self, Either as Race};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// An entry of the ordered output queue.
enum Slot<E, O, D> {
  Elem(Promise<Exit<E, O>>),
  End(Exit<E, D>),
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
  /// Like [`map_out_io`](Self::map_out_io), running up to `n` effects at
  /// once. Results are written in the order of the elements they came from.
  /// The first failing effect fails the channel and interrupts the others.
  /// An `n` of zero is treated as one.
  pub fn map_out_io_par<OutElem2, F, Fut>(
    self,
    n: usize,
    f: F,
  ) -> Channel<Env, InErr, InElem, InDone, OutErr, OutElem2, OutDone>
  where
    OutElem2: Data,
    F: Fn(OutElem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutElem2, OutErr>> + Send + 'static,
  {
    let n = n.max(1);
    let f = Arc::new(f);
    Channel::unwrap_scoped_env(move |scope: Scope, env: Env| {
      let this = self.clone();
      let f = f.clone();
      async move {
        let input = SingleProducerAsyncInput::<InErr, InElem, InDone>::new();
        let reader = Channel::<Env, (), (), (), InErr, InElem, InDone>::from_input(input.clone());
        let upstream = reader.pipe_to(this).to_pull_in(&scope, env).await;
        let (tx, rx) = mpsc::channel::<Slot<OutErr, OutElem2, OutDone>>(n);
        let supervisor = Supervisor::new_in(&scope).await;
        let gate = PermitGate::new(n);
        let error_signal = Promise::<Cause<OutErr>>::new();

        let tracker = supervisor.clone();
        let driver = Fiber::<(), ()>::fork(async move {
          loop {
            match upstream.pull().await {
              Err(cause) => {
                let _ = tx.send(Slot::End(Err(cause))).await;
                return Ok(());
              }
              Ok(Either::Left(done)) => {
                let _all = gate.acquire_many(n).await;
                let _ = tx.send(Slot::End(Ok(done))).await;
                return Ok(());
              }
              Ok(Either::Right(elem)) => {
                let result = Promise::<Exit<OutErr, OutElem2>>::new();
                if tx.send(Slot::Elem(result.clone())).await.is_err() {
                  return Ok(());
                }
                let permit = gate.acquire().await;
                let work = AssertUnwindSafe(f(elem))
                  .catch_unwind()
                  .map(|outcome| match outcome {
                    Ok(result) => result.map_err(Cause::Fail),
                    Err(payload) => Err(Cause::Die(Defect::from_panic(payload))),
                  });
                let stop = future::select(error_signal.wait(), tracker.shutdown.wait());
                let error_signal = error_signal.clone();
                tracker.track(Fiber::fork(async move {
                  let _permit = permit;
                  let exit = match future::select(Box::pin(work), stop).await {
                    Race::Left((exit, _)) => exit,
                    Race::Right((Race::Left((cause, _)), _)) => Err(cause),
                    Race::Right((Race::Right(_), _)) => Err(Cause::Interrupt(FiberId::current())),
                  };
                  if let Err(cause) = &exit {
                    error_signal.succeed(cause.clone());
                  }
                  result.succeed(exit);
                  Ok(())
                }));
              }
            }
          }
        });
        supervisor.set_driver(driver);

        let queue = Arc::new(Mutex::new(rx));
        let consumer = Channel::<Env, (), (), (), OutErr, OutElem2, OutDone>::pump(Arc::new(move || {
          let queue = queue.clone();
          async move {
            match future::poll_fn(|cx| queue.lock().poll_recv(cx)).await {
              Some(Slot::Elem(result)) => result.wait().await.map(Either::Right),
              Some(Slot::End(exit)) => exit.map(Either::Left),
              None => Err(Cause::die(ChannelError::QueueShutdown.to_string())),
            }
          }
          .boxed()
        }));
        Ok::<_, OutErr>(consumer.embed_input(input))
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use crate::cause::Cause;
  use crate::channel::Source;

  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  use pretty_assertions::assert_eq;

  type Ints = Source<String, i32, ()>;

  #[tokio::test]
  async fn results_keep_input_order() {
    let channel = Ints::write_all(vec![30, 1, 20, 2]).map_out_io_par(4, |v| async move {
      tokio::time::sleep(Duration::from_millis(v as u64)).await;
      Ok::<_, String>(v * 2)
    });
    assert_eq!(channel.run_collect().await, Ok((vec![60, 2, 40, 4], ())));
  }

  #[tokio::test]
  async fn at_most_n_effects_run_at_once() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let channel = Ints::write_all(0..8).map_out_io_par(3, move |v| {
      let (r, p) = (r.clone(), p.clone());
      async move {
        let now = r.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        r.fetch_sub(1, Ordering::SeqCst);
        Ok::<_, String>(v)
      }
    });
    let (elems, ()) = channel.run_collect().await.unwrap();
    assert_eq!(elems, (0..8).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) <= 3);
  }

  #[tokio::test]
  async fn a_failing_effect_fails_the_channel() {
    let channel = Ints::write_all(vec![1, 2, 3]).map_out_io_par(2, |v| async move {
      if v == 2 {
        Err(format!("bad {v}"))
      } else {
        Ok(v)
      }
    });
    let exit = tokio::time::timeout(Duration::from_secs(1), channel.run_collect())
      .await
      .expect("channel did not stop");
    assert_eq!(exit, Err(Cause::Fail("bad 2".to_string())));
  }
}
