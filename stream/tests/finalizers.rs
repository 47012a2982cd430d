mod common;

use common::{init_tracing, resource, within, Ints, Log};
use fibre_stream::{Cause, Channel, Either, Source};

use pretty_assertions::assert_eq;

fn nested(log: &Log, body: Ints) -> Ints {
  resource("outer", log, resource("inner", log, body))
}

fn expected() -> Vec<String> {
  ["acquire outer", "acquire inner", "release inner", "release outer"]
    .map(String::from)
    .to_vec()
}

#[tokio::test]
async fn releases_run_in_reverse_on_success() {
  init_tracing();
  let log = Log::default();
  let exit = nested(&log, Ints::write_all(vec![1, 2])).run_collect().await;
  assert_eq!(exit, Ok((vec![1, 2], ())));
  assert_eq!(log.events(), expected());
}

#[tokio::test]
async fn releases_run_in_reverse_on_failure() {
  let log = Log::default();
  let body = Ints::write(1).zip_right(Ints::fail("boom".to_string()));
  let exit = nested(&log, body).run().await;
  assert_eq!(exit, Err(Cause::Fail("boom".to_string())));
  assert_eq!(log.events(), expected());
}

#[tokio::test]
async fn releases_run_when_an_effect_panics() {
  let log = Log::default();
  let body = Ints::from_io(|| async {
    if true {
      panic!("kaboom");
    }
    Ok(())
  });
  let exit = nested(&log, body).run().await;
  assert!(matches!(exit, Err(ref cause) if cause.is_die()));
  assert_eq!(log.events(), expected());
}

#[tokio::test]
async fn releases_run_when_a_pull_is_closed_early() {
  let log = Log::default();
  let pull = nested(&log, Ints::write(1).zip_right(Ints::never())).to_pull(());
  assert_eq!(within("first pull", pull.pull()).await, Ok(Either::Right(1)));
  assert_eq!(log.events(), expected()[..2].to_vec());
  assert_eq!(within("close", pull.close()).await, Ok(()));
  assert_eq!(log.events(), expected());
}

#[tokio::test]
async fn ensuring_layers_unwind_inside_out() {
  let log = Log::default();
  let (inner, outer) = (log.clone(), log.clone());
  let channel = Ints::write(1)
    .ensuring(move || {
      let log = inner.clone();
      async move { log.push("inner") }
    })
    .ensuring(move || {
      let log = outer.clone();
      async move { log.push("outer") }
    });
  assert_eq!(channel.run_drain().await, Ok(()));
  assert_eq!(log.events(), vec!["inner".to_string(), "outer".to_string()]);
}

fn connection(log: &Log) -> Source<String, &'static str, ()> {
  let (on_acquire, on_release) = (log.clone(), log.clone());
  Source::bracket_out_exit(
    move || {
      let log = on_acquire.clone();
      async move {
        log.push("open");
        Ok("conn")
      }
    },
    move |conn, exit| {
      let log = on_release.clone();
      async move { log.push(format!("close {conn} ok={}", exit.is_ok())) }
    },
  )
}

#[tokio::test]
async fn bracket_out_releases_once_the_element_was_taken() {
  let log = Log::default();
  let failing = connection(&log).zip_right(Source::<String, &'static str, ()>::fail("query".to_string()));
  let exit = failing.run_collect().await;
  assert_eq!(exit, Err(Cause::Fail("query".to_string())));
  assert_eq!(log.events(), vec!["open".to_string(), "close conn ok=true".to_string()]);
}

#[tokio::test]
async fn bracket_out_releases_on_early_close() {
  let log = Log::default();
  let pull = connection(&log).to_pull(());
  assert_eq!(within("pull", pull.pull()).await, Ok(Either::Right("conn")));
  assert_eq!(within("close", pull.close()).await, Ok(()));
  assert_eq!(pull.close().await, Ok(()));
  assert_eq!(log.events(), vec!["open".to_string(), "close conn ok=false".to_string()]);
}

#[tokio::test]
async fn both_sides_of_a_pipe_are_finalized() {
  let log = Log::default();
  let (left_log, right_log) = (log.clone(), log.clone());
  let left = Ints::write_all(vec![1, 2, 3]).ensuring(move || {
    let log = left_log.clone();
    async move { log.push("left") }
  });
  let right = Channel::<(), String, i32, (), String, i32, ()>::identity().map_out(|v| v + 1).ensuring(move || {
    let log = right_log.clone();
    async move { log.push("right") }
  });
  let exit = left.pipe_to(right).run_collect().await;
  assert_eq!(exit, Ok((vec![2, 3, 4], ())));
  let mut events = log.events();
  events.sort();
  assert_eq!(events, vec!["left".to_string(), "right".to_string()]);
}
