// src/either.rs

/// A value of one of two types. Pulls report `Right(element)` for an emitted
/// element and `Left(done)` once the channel finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either<L, R> {
  Left(L),
  Right(R),
}

impl<L, R> Either<L, R> {
  pub fn is_left(&self) -> bool {
    matches!(self, Either::Left(_))
  }

  pub fn is_right(&self) -> bool {
    matches!(self, Either::Right(_))
  }

  pub fn left(self) -> Option<L> {
    match self {
      Either::Left(l) => Some(l),
      Either::Right(_) => None,
    }
  }

  pub fn right(self) -> Option<R> {
    match self {
      Either::Left(_) => None,
      Either::Right(r) => Some(r),
    }
  }

  pub fn fold<T>(self, on_left: impl FnOnce(L) -> T, on_right: impl FnOnce(R) -> T) -> T {
    match self {
      Either::Left(l) => on_left(l),
      Either::Right(r) => on_right(r),
    }
  }
}
