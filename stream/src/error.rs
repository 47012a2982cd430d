// src/error.rs

use crate::cause::{Cause, FiberId};

use thiserror::Error;

/// Errors reported by the engine itself, as opposed to the failures carried
/// by a channel's own `Cause`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
  /// A producer operation was attempted on a hand-off cell that already
  /// reached a terminal state.
  #[error("hand-off cell is already terminated; operation interrupted {0}")]
  ProtocolViolation(FiberId),

  /// A configuration value was rejected.
  #[error("invalid configuration value for '{field}': {message}")]
  InvalidConfig { field: &'static str, message: String },

  /// The queue feeding a merged channel was shut down before it produced a
  /// terminal value.
  #[error("merge queue shut down before completion")]
  QueueShutdown,
}

/// Returned when the caller was interrupted instead of completing its
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted by {0}")]
pub struct Interrupted(pub FiberId);

impl Interrupted {
  pub fn into_cause<E>(self) -> Cause<E> {
    Cause::Interrupt(self.0)
  }
}

impl From<Interrupted> for ChannelError {
  fn from(value: Interrupted) -> Self {
    ChannelError::ProtocolViolation(value.0)
  }
}

/// A specialized `Result` type for engine-level operations.
pub type Result<T, E = ChannelError> = std::result::Result<T, E>;
