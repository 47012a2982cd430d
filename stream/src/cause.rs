// src/cause.rs

//! The failure algebra shared by every channel: a tree of checked failures,
//! defects and interruptions composed sequentially or in parallel.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Identity of the task that requested an interruption.
///
/// Wraps the tokio task id of the caller when one is available. Code that runs
/// outside of a spawned task (e.g. directly inside `block_on`) is identified
/// by `FiberId::NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(Option<tokio::task::Id>);

impl FiberId {
  pub const NONE: FiberId = FiberId(None);

  /// Returns the identity of the currently running task.
  pub fn current() -> Self {
    FiberId(tokio::task::try_id())
  }

  pub(crate) fn from_task(id: tokio::task::Id) -> Self {
    FiberId(Some(id))
  }

  pub fn task_id(&self) -> Option<tokio::task::Id> {
    self.0
  }
}

impl fmt::Display for FiberId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      Some(id) => write!(f, "fiber#{}", id),
      None => f.write_str("fiber#none"),
    }
  }
}

/// An unchecked failure: a panic raised while running user code, or an
/// explicit `die`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Defect {
  message: Arc<str>,
}

impl Defect {
  pub fn new(message: impl Into<String>) -> Self {
    let message: String = message.into();
    Defect {
      message: Arc::from(message),
    }
  }

  /// Builds a defect out of a panic payload.
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
      Defect::new(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
      Defect::new(s.clone())
    } else {
      Defect::new("panic with a non-string payload")
    }
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

/// A tree describing why a computation did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
  /// No failure at all. The identity of `then` and `both`.
  Empty,
  /// A checked, recoverable failure.
  Fail(E),
  /// An unchecked failure.
  Die(Defect),
  /// Cooperative cancellation requested by the given fiber.
  Interrupt(FiberId),
  /// The left cause happened, then the right one (e.g. a failure followed by
  /// a failing finalizer).
  Then(Box<Cause<E>>, Box<Cause<E>>),
  /// Both causes happened concurrently.
  Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
  pub fn fail(error: E) -> Self {
    Cause::Fail(error)
  }

  pub fn die(message: impl Into<String>) -> Self {
    Cause::Die(Defect::new(message))
  }

  pub fn interrupt(by: FiberId) -> Self {
    Cause::Interrupt(by)
  }

  /// Sequential composition. `Empty` on either side is dropped.
  pub fn then(self, that: Cause<E>) -> Cause<E> {
    match (self, that) {
      (Cause::Empty, right) => right,
      (left, Cause::Empty) => left,
      (left, right) => Cause::Then(Box::new(left), Box::new(right)),
    }
  }

  /// Parallel composition. `Empty` on either side is dropped.
  pub fn both(self, that: Cause<E>) -> Cause<E> {
    match (self, that) {
      (Cause::Empty, right) => right,
      (left, Cause::Empty) => left,
      (left, right) => Cause::Both(Box::new(left), Box::new(right)),
    }
  }

  pub fn map<E2>(self, f: impl Fn(E) -> E2) -> Cause<E2> {
    self.map_ref(&f)
  }

  fn map_ref<E2, F: Fn(E) -> E2>(self, f: &F) -> Cause<E2> {
    match self {
      Cause::Empty => Cause::Empty,
      Cause::Fail(e) => Cause::Fail(f(e)),
      Cause::Die(d) => Cause::Die(d),
      Cause::Interrupt(id) => Cause::Interrupt(id),
      Cause::Then(l, r) => Cause::Then(Box::new(l.map_ref(f)), Box::new(r.map_ref(f))),
      Cause::Both(l, r) => Cause::Both(Box::new(l.map_ref(f)), Box::new(r.map_ref(f))),
    }
  }

  /// Rewrites every `Fail` leaf into a whole new cause.
  pub fn flat_map<E2>(self, f: impl Fn(E) -> Cause<E2>) -> Cause<E2> {
    self.flat_map_ref(&f)
  }

  fn flat_map_ref<E2, F: Fn(E) -> Cause<E2>>(self, f: &F) -> Cause<E2> {
    match self {
      Cause::Empty => Cause::Empty,
      Cause::Fail(e) => f(e),
      Cause::Die(d) => Cause::Die(d),
      Cause::Interrupt(id) => Cause::Interrupt(id),
      Cause::Then(l, r) => l.flat_map_ref(f).then(r.flat_map_ref(f)),
      Cause::Both(l, r) => l.flat_map_ref(f).both(r.flat_map_ref(f)),
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      Cause::Empty => true,
      Cause::Then(l, r) | Cause::Both(l, r) => l.is_empty() && r.is_empty(),
      _ => false,
    }
  }

  /// Checked failures, left to right.
  pub fn failures(&self) -> Vec<&E> {
    let mut out = Vec::new();
    self.collect_leaves(&mut |leaf| {
      if let Cause::Fail(e) = leaf {
        out.push(e);
      }
    });
    out
  }

  pub fn defects(&self) -> Vec<&Defect> {
    let mut out = Vec::new();
    self.collect_leaves(&mut |leaf| {
      if let Cause::Die(d) = leaf {
        out.push(d);
      }
    });
    out
  }

  pub fn interruptors(&self) -> Vec<FiberId> {
    let mut out = Vec::new();
    self.collect_leaves(&mut |leaf| {
      if let Cause::Interrupt(id) = leaf {
        out.push(*id);
      }
    });
    out
  }

  pub fn is_interrupted(&self) -> bool {
    !self.interruptors().is_empty()
  }

  /// True when the cause contains interruptions and nothing else.
  pub fn is_interrupted_only(&self) -> bool {
    let mut only = true;
    let mut any = false;
    self.collect_leaves(&mut |leaf| match leaf {
      Cause::Interrupt(_) => any = true,
      Cause::Empty => {}
      _ => only = false,
    });
    any && only
  }

  pub fn is_failure(&self) -> bool {
    !self.failures().is_empty()
  }

  pub fn is_die(&self) -> bool {
    !self.defects().is_empty()
  }

  fn collect_leaves<'a>(&'a self, visit: &mut impl FnMut(&'a Cause<E>)) {
    match self {
      Cause::Then(l, r) | Cause::Both(l, r) => {
        l.collect_leaves(visit);
        r.collect_leaves(visit);
      }
      leaf => visit(leaf),
    }
  }

  /// Drops every `Fail` leaf, keeping defects and interruptions.
  pub fn strip_failures<E2>(self) -> Cause<E2> {
    self.flat_map(|_| Cause::Empty)
  }
}

impl<E: Clone> Cause<E> {
  /// The first checked failure, or the cause itself retyped when there is
  /// none.
  pub fn failure_or_cause<E2>(self) -> Result<E, Cause<E2>> {
    let first = self.failures().first().map(|e| (*e).clone());
    match first {
      Some(e) => Ok(e),
      None => Err(self.strip_failures()),
    }
  }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Cause::Empty => f.write_str("<empty>"),
      Cause::Fail(e) => write!(f, "Fail({:?})", e),
      Cause::Die(d) => write!(f, "Die({})", d),
      Cause::Interrupt(id) => write!(f, "Interrupt({})", id),
      Cause::Then(l, r) => write!(f, "({} then {})", l, r),
      Cause::Both(l, r) => write!(f, "({} and {})", l, r),
    }
  }
}

impl<E: fmt::Debug> std::error::Error for Cause<E> {}

/// The terminal outcome of a computation.
pub type Exit<E, A> = Result<A, Cause<E>>;

/// Sequential AND of two exits: the right value wins on success, and a double
/// failure keeps both causes in order.
pub fn zip_right<E, A, B>(left: Exit<E, A>, right: Exit<E, B>) -> Exit<E, B> {
  match (left, right) {
    (Ok(_), right) => right,
    (Err(c), Ok(_)) => Err(c),
    (Err(l), Err(r)) => Err(l.then(r)),
  }
}

/// Maps the success and failure channels of an exit.
pub fn map_exit<E, A, E2, A2>(exit: Exit<E, A>, f: impl FnOnce(A) -> A2, g: impl Fn(E) -> E2) -> Exit<E2, A2> {
  match exit {
    Ok(a) => Ok(f(a)),
    Err(c) => Err(c.map(g)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn then_and_both_drop_empty() {
    let c: Cause<i32> = Cause::Empty.then(Cause::Fail(1));
    assert_eq!(c, Cause::Fail(1));
    let c: Cause<i32> = Cause::Fail(1).both(Cause::Empty);
    assert_eq!(c, Cause::Fail(1));
  }

  #[test]
  fn failures_are_collected_in_order() {
    let c = Cause::Fail(1).then(Cause::die("boom")).both(Cause::Fail(2));
    assert_eq!(c.failures(), vec![&1, &2]);
    assert_eq!(c.defects().len(), 1);
    assert!(!c.is_interrupted_only());
  }

  #[test]
  fn interrupted_only() {
    let c: Cause<()> = Cause::interrupt(FiberId::NONE).then(Cause::interrupt(FiberId::NONE));
    assert!(c.is_interrupted_only());
    assert_eq!(c.interruptors().len(), 2);
  }

  #[test]
  fn zip_right_keeps_both_failures() {
    let exit: Exit<&str, ()> = zip_right(Err::<(), _>(Cause::Fail("a")), Err(Cause::Fail("b")));
    assert_eq!(
      exit,
      Err(Cause::Then(Box::new(Cause::Fail("a")), Box::new(Cause::Fail("b"))))
    );
  }

  #[test]
  fn failure_or_cause_retypes_defects() {
    let c: Cause<i32> = Cause::die("bad");
    let r: Result<i32, Cause<String>> = c.failure_or_cause();
    assert_eq!(r, Err(Cause::Die(Defect::new("bad"))));
  }

  #[test]
  fn defect_from_panic_payload() {
    let payload = std::panic::catch_unwind(|| panic!("exploded")).unwrap_err();
    assert_eq!(Defect::from_panic(payload).message(), "exploded");
  }
}
