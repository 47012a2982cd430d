mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{within, Ints};
use fibre_stream::{Cause, Either, SingleProducerAsyncInput, Source};

use pretty_assertions::assert_eq;

#[tokio::test]
async fn pull_round_trip_repeats_the_terminal_value() {
  let pull = Source::<String, char, ()>::write_all(vec!['a', 'b', 'c'])
    .map(|_| 42u8)
    .to_pull(());
  assert_eq!(pull.pull().await, Ok(Either::Right('a')));
  assert_eq!(pull.pull().await, Ok(Either::Right('b')));
  assert_eq!(pull.pull().await, Ok(Either::Right('c')));
  for _ in 0..5 {
    assert_eq!(pull.pull().await, Ok(Either::Left(42u8)));
  }
  assert_eq!(pull.close().await, Ok(()));
}

#[tokio::test]
async fn a_failed_pull_keeps_failing() {
  let pull = Ints::write(1).zip_right(Ints::fail("gone".to_string())).to_pull(());
  assert_eq!(pull.pull().await, Ok(Either::Right(1)));
  for _ in 0..3 {
    assert_eq!(pull.pull().await, Err(Cause::Fail("gone".to_string())));
  }
}

#[tokio::test]
async fn emit_waits_until_the_element_is_claimed() {
  let cell = SingleProducerAsyncInput::<(), i32, ()>::new();
  let first_sent = Arc::new(AtomicBool::new(false));
  let second_sent = Arc::new(AtomicBool::new(false));
  let producer = {
    let (cell, first, second) = (cell.clone(), first_sent.clone(), second_sent.clone());
    tokio::spawn(async move {
      cell.emit(1).await.unwrap();
      first.store(true, Ordering::SeqCst);
      cell.emit(2).await.unwrap();
      second.store(true, Ordering::SeqCst);
    })
  };
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(!first_sent.load(Ordering::SeqCst));
  assert_eq!(within("take", cell.take()).await, Ok(1));
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(first_sent.load(Ordering::SeqCst));
  assert!(!second_sent.load(Ordering::SeqCst));
  assert_eq!(within("take", cell.take()).await, Ok(2));
  within("producer", producer).await.unwrap();
  assert!(second_sent.load(Ordering::SeqCst));
}

#[tokio::test]
async fn each_element_reaches_one_consumer() {
  let cell = SingleProducerAsyncInput::<(), u32, ()>::new();
  let consumers: Vec<_> = (0..4)
    .map(|_| {
      let cell = cell.clone();
      tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Ok(v) = cell.take().await {
          seen.push(v);
        }
        seen
      })
    })
    .collect();
  for v in 0..100 {
    within("emit", cell.emit(v)).await.unwrap();
  }
  cell.done(()).unwrap();
  let mut all = Vec::new();
  for consumer in consumers {
    all.extend(within("consumer", consumer).await.unwrap());
  }
  all.sort_unstable();
  assert_eq!(all, (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn terminal_states_are_replayed_and_final() {
  let cell = SingleProducerAsyncInput::<String, i32, &'static str>::new();
  cell.done("finished").unwrap();
  for _ in 0..3 {
    assert_eq!(cell.take().await, Err(Either::Right("finished")));
  }
  assert!(cell.error(Cause::Fail("late".to_string())).is_err());
  assert!(within("emit after done", cell.emit(1)).await.is_err());
}

#[tokio::test]
async fn abandoned_pull_resumes_its_effect_instead_of_rerunning_it() {
  let runs = Arc::new(AtomicUsize::new(0));
  let counter = runs.clone();
  let channel = Ints::from_io(move || {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(())
    }
  })
  .zip_right(Ints::write(5));
  let pull = channel.to_pull(());
  assert!(tokio::time::timeout(Duration::from_millis(10), pull.pull()).await.is_err());
  assert_eq!(within("second pull", pull.pull()).await, Ok(Either::Right(5)));
  assert_eq!(runs.load(Ordering::SeqCst), 1);
  assert_eq!(pull.pull().await, Ok(Either::Left(())));
  assert_eq!(pull.close().await, Ok(()));
}

#[tokio::test]
async fn closing_during_an_acquire_releases_the_resource() {
  let released = Arc::new(AtomicBool::new(false));
  let flag = released.clone();
  let channel = Ints::bracket_out_exit(
    || async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok(1)
    },
    move |_, exit| {
      let flag = flag.clone();
      async move { flag.store(exit.is_err(), Ordering::SeqCst) }
    },
  );
  let pull = channel.to_pull(());
  assert!(tokio::time::timeout(Duration::from_millis(5), pull.pull()).await.is_err());
  assert_eq!(within("close", pull.close()).await, Ok(()));
  assert!(released.load(Ordering::SeqCst));
}
