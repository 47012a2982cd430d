//! A resource-safe, pull-based channel interpreter.
//!
//! A [`Channel`] describes a program that reads from an upstream protocol
//! (errors, elements, a terminal value) and writes to a downstream one. Channels
//! compose by piping, sequencing, flattening and concurrent merging, and run
//! on tokio through a step-wise interpreter that performs effects and upstream
//! reads one at a time.
//!
//! # Features
//! - **Backpressure**: elements are produced only when pulled; bridged inputs
//!   hold at most one element in flight.
//! - **Guaranteed finalization**: `ensuring`, `bracket_out` and
//!   `acquire_release_with` finalizers run exactly once, in reverse order, on
//!   success, failure and interruption.
//! - **Concurrent fan-in**: `merge_with`, `merge_all_with` and
//!   `map_out_io_par` with bounded concurrency.
//! - **Full failure information**: failures surface as a [`Cause`] tree
//!   keeping typed errors, defects and interruptions apart.

// Public modules that form the API
pub mod cause;
pub mod channel;
pub mod either;
pub mod error;
pub mod executor;
pub mod input;
pub mod merge;
pub mod runtime;
pub mod value;

// Re-export the primary user-facing types for convenience
pub use cause::{Cause, Defect, Exit, FiberId};
pub use channel::{
  Channel, ChildExecutorDecision, Pull, QueueItem, Source, UpstreamPullRequest, UpstreamPullStrategy,
};
pub use either::Either;
pub use error::{ChannelError, Interrupted};
pub use input::{AsyncInputConsumer, AsyncInputProducer, SingleProducerAsyncInput};
pub use merge::{MergeAllConfig, MergeAllConfigBuilder, MergeDecision, MergeState, MergeStrategy};
pub use runtime::{Fiber, PermitGate, Promise, Scope};
pub use value::Data;
