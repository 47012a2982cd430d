mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, within, Ints, Log};
use fibre_stream::{Cause, Either, Exit, MergeAllConfig, MergeDecision, MergeStrategy, Source};

use futures_util::future;
use pretty_assertions::assert_eq;

type Children = Source<String, Ints, ()>;

#[tokio::test]
async fn merge_short_circuits_on_failure() {
  init_tracing();
  let log = Log::default();
  let on_exit = log.clone();
  let never = Ints::never().ensuring_with(move |exit| {
    let log = on_exit.clone();
    async move {
      if matches!(exit, Err(ref cause) if cause.is_interrupted()) {
        log.push("never side interrupted");
      }
    }
  });
  let failing = Ints::from_io(|| async {
    tokio::time::sleep(Duration::from_millis(20)).await;
    Err("e".to_string())
  });
  let merged = failing.merge_with(
    never,
    |exit: Exit<String, ()>| MergeDecision::done(future::ready(exit)),
    |exit: Exit<String, ()>| MergeDecision::await_with(move |_: Exit<String, ()>| future::ready(exit.clone())),
  );
  let exit = within("short-circuiting merge", merged.run()).await;
  assert_eq!(exit, Err(Cause::Fail("e".to_string())));
  assert_eq!(log.events(), vec!["never side interrupted".to_string()]);
}

#[tokio::test]
async fn merge_all_never_runs_more_than_n_children() {
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let child = |i: i32| {
    let (running, peak) = (running.clone(), peak.clone());
    Ints::from_io(move || {
      let (running, peak) = (running.clone(), peak.clone());
      async move {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
      }
    })
    .zip_right(Ints::write(i))
  };
  let children = Children::write_all((0..5).map(child));
  let config = MergeAllConfig::builder()
    .concurrency(2)
    .strategy(MergeStrategy::BackPressure)
    .build()
    .unwrap();
  let (mut elems, ()) = within("merge_all", Ints::merge_all(children, config).run_collect())
    .await
    .unwrap();
  elems.sort_unstable();
  assert_eq!(elems, vec![0, 1, 2, 3, 4]);
  assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
  assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn buffer_sliding_cancels_the_oldest_outstanding_child() {
  let log = Log::default();
  let stuck = |name: &'static str, value: i32| {
    let log = log.clone();
    Ints::write(value).zip_right(Ints::never()).ensuring_with(move |exit| {
      let log = log.clone();
      async move {
        if exit.is_err() {
          log.push(format!("cancelled {name}"));
        }
      }
    })
  };
  let children = Children::write_all(vec![stuck("first", 1), stuck("second", 2)])
    .zip_right(Children::from_io(|| async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(())
    }))
    .zip_right(Children::write(Ints::write(3)));
  let config = MergeAllConfig::builder()
    .concurrency(2)
    .strategy(MergeStrategy::BufferSliding)
    .build()
    .unwrap();
  let pull = Ints::merge_all(children, config).to_pull(());
  let mut seen = Vec::new();
  while seen.len() < 3 {
    match within("pull", pull.pull()).await {
      Ok(Either::Right(v)) => seen.push(v),
      other => panic!("unexpected pull result {other:?}"),
    }
  }
  seen.sort_unstable();
  assert_eq!(seen, vec![1, 2, 3]);
  assert_eq!(log.events(), vec!["cancelled first".to_string()]);
  assert_eq!(within("close", pull.close()).await, Ok(()));
  assert_eq!(
    log.events(),
    vec!["cancelled first".to_string(), "cancelled second".to_string()]
  );
}

#[tokio::test]
async fn merge_out_flattens_concurrently() {
  let config = MergeAllConfig::builder().concurrency(3).buffer_size(1).build().unwrap();
  let nested = Children::write_all((1..=3).map(|i| Ints::write_all(vec![i; i as usize])));
  let (mut elems, ()) = within("merge_out", nested.merge_out(config).run_collect()).await.unwrap();
  elems.sort_unstable();
  assert_eq!(elems, vec![1, 2, 2, 3, 3, 3]);
}

#[tokio::test]
async fn interrupt_when_ends_an_endless_channel() {
  let channel = Ints::write(7).zip_right(Ints::never()).interrupt_when(|| async {
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(())
  });
  let exit = within("interrupted channel", channel.run_collect()).await;
  assert_eq!(exit, Ok((vec![7], ())));
}

#[tokio::test]
async fn map_out_io_par_preserves_order() {
  let channel = Ints::write_all(vec![40, 10, 30, 20]).map_out_io_par(4, |v| async move {
    tokio::time::sleep(Duration::from_millis(v as u64)).await;
    Ok::<_, String>(v + 1)
  });
  let exit = within("map_out_io_par", channel.run_collect()).await;
  assert_eq!(exit, Ok((vec![41, 11, 31, 21], ())));
}

#[tokio::test]
async fn interrupted_side_finishes_its_acquire_and_releases() {
  let log = Log::default();
  let (on_acquire, on_release) = (log.clone(), log.clone());
  let guarded = Ints::bracket_out_exit(
    move || {
      let log = on_acquire.clone();
      async move {
        log.push("open");
        tokio::time::sleep(Duration::from_millis(60)).await;
        log.push("opened");
        Ok(7)
      }
    },
    move |_, exit| {
      let log = on_release.clone();
      async move { log.push(format!("release ok={}", exit.is_ok())) }
    },
  );
  let failing = Ints::from_io(|| async {
    tokio::time::sleep(Duration::from_millis(10)).await;
    Err("e".to_string())
  });
  let merged = failing.merge_with(guarded, MergeDecision::done_exit, MergeDecision::done_exit);
  let exit = within("merge with an interrupted acquire", merged.run()).await;
  assert_eq!(exit, Err(Cause::Fail("e".to_string())));
  assert_eq!(
    log.events(),
    vec!["open".to_string(), "opened".to_string(), "release ok=false".to_string()]
  );
}
