// src/value.rs

//! Type-erased payloads flowing through the interpreter.
//!
//! The executor and its sub-executor stack never know the concrete element,
//! error or terminal types of the channels they run. Every value is boxed
//! into an `AnyValue` when it enters the engine and recovered by the typed
//! boundary (`Channel` constructors, `Pull`, `run`) that knows its type.

use crate::cause::{Cause, Defect, FiberId};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

/// Bounds every value moved through a channel must satisfy.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// A shared, type-erased value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// A type-erased exit.
pub type AnyExit = Result<AnyValue, Cause<AnyValue>>;

/// A suspended, type-erased computation the driver must run to completion.
pub type Effect = BoxFuture<'static, AnyExit>;

#[inline]
pub(crate) fn erase<T: Send + Sync + 'static>(value: T) -> AnyValue {
  Arc::new(value)
}

#[inline]
pub(crate) fn unit() -> AnyValue {
  erase(())
}

/// Recovers a concrete value. A mismatch means the AST was assembled with
/// inconsistent types, which the typed API rules out.
pub(crate) fn unerase<T: Data>(value: AnyValue) -> T {
  match value.downcast::<T>() {
    Ok(arc) => Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone()),
    Err(_) => panic!(
      "fibre_stream: erased value is not a `{}`",
      std::any::type_name::<T>()
    ),
  }
}

pub(crate) fn try_unerase<T: Data>(value: &AnyValue) -> Option<T> {
  value.downcast_ref::<T>().cloned()
}

pub(crate) fn erase_cause<E: Data>(cause: Cause<E>) -> Cause<AnyValue> {
  cause.map(erase)
}

pub(crate) fn unerase_cause<E: Data>(cause: Cause<AnyValue>) -> Cause<E> {
  cause.map(unerase::<E>)
}

pub(crate) fn erase_exit<E: Data, A: Data>(exit: Result<A, Cause<E>>) -> AnyExit {
  match exit {
    Ok(a) => Ok(erase(a)),
    Err(c) => Err(erase_cause(c)),
  }
}

pub(crate) fn unerase_exit<E: Data, A: Data>(exit: AnyExit) -> Result<A, Cause<E>> {
  match exit {
    Ok(a) => Ok(unerase(a)),
    Err(c) => Err(unerase_cause(c)),
  }
}

/// Converts an exit observed by a finalizer. A finalizer may be closed by an
/// enclosing scope whose exit belongs to another channel; any part of such an
/// exit that does not carry the finalizer's own types is seen as an
/// interruption.
pub(crate) fn observe_exit<E: Data, A: Data>(exit: &AnyExit) -> Result<A, Cause<E>> {
  match exit {
    Ok(a) => try_unerase::<A>(a).ok_or_else(|| Cause::Interrupt(FiberId::current())),
    Err(c) => Err(c.clone().flat_map(|e| match try_unerase::<E>(&e) {
      Some(e) => Cause::Fail(e),
      None => Cause::Interrupt(FiberId::current()),
    })),
  }
}

/// Shape of an exit without its payloads.
pub(crate) fn exit_shape(exit: &AnyExit) -> Result<(), Cause<()>> {
  match exit {
    Ok(_) => Ok(()),
    Err(c) => Err(c.clone().map(|_| ())),
  }
}

/// Boxes a future and turns a panic raised while polling it into a defect.
pub(crate) fn guard_effect<F>(future: F) -> Effect
where
  F: Future<Output = AnyExit> + Send + 'static,
{
  AssertUnwindSafe(future)
    .catch_unwind()
    .map(|result| result.unwrap_or_else(|payload| Err(Cause::Die(Defect::from_panic(payload)))))
    .boxed()
}

/// Runs a synchronous thunk, turning a panic into a defect.
pub(crate) fn guard_sync<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
  std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

pub(crate) fn ready(exit: AnyExit) -> Effect {
  futures_util::future::ready(exit).boxed()
}
