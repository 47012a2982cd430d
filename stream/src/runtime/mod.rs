// src/runtime/mod.rs

//! Small concurrency primitives the interpreter and the merge operators are
//! built from: single-assignment promises, interruptible fibers, closeable
//! scopes and a fair permit gate.

pub mod fiber;
pub mod permit_gate;
pub mod promise;
pub mod scope;

pub use fiber::Fiber;
pub use permit_gate::{PermitGate, PermitGuard};
pub use promise::Promise;
pub use scope::Scope;
