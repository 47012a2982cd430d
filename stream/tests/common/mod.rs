#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fibre_stream::{Channel, Source};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub type Ints = Source<String, i32, ()>;

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Installs a test log subscriber once; filter with `RUST_LOG`.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// Awaits `future`, failing the test if it takes longer than [`TIMEOUT`].
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
  match tokio::time::timeout(TIMEOUT, future).await {
    Ok(output) => output,
    Err(_) => panic!("{what} did not finish within {TIMEOUT:?}"),
  }
}

/// An ordered record of events shared between a test and its channels.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
  pub fn push(&self, event: impl Into<String>) {
    self.0.lock().push(event.into());
  }

  pub fn events(&self) -> Vec<String> {
    self.0.lock().clone()
  }
}

/// Acquires `name`, runs `use_`, and releases `name` afterwards, logging both.
pub fn resource(name: &'static str, log: &Log, use_: Ints) -> Ints {
  let (on_acquire, on_release) = (log.clone(), log.clone());
  Channel::acquire_release_with(
    move || {
      let log = on_acquire.clone();
      async move {
        log.push(format!("acquire {name}"));
        Ok::<_, String>(name)
      }
    },
    move |name: &'static str, _exit| {
      let log = on_release.clone();
      async move { log.push(format!("release {name}")) }
    },
    move |_| use_.clone(),
  )
}
