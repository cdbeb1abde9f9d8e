//! The CLEANALLRUV protocol bindings. These are the types that cross a process boundary,
//! either between replicas as coordination messages, or to an administrator as task status.
//!
//! Mixed-version topologies depend on these staying stable, so changes here must remain
//! compatible with the previous encoding.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

pub mod constants;
pub mod error;
pub mod message;
pub mod task;

pub use crate::error::{OperationError, SendError};
pub use crate::message::{CoordinationMessage, CoordinationResponse, Csn, ReplicaId, RuvRange};
pub use crate::task::{
    AbortPhase, CleanPhase, TaskExitCode, TaskKey, TaskKind, TaskRole, TaskStatusSnapshot,
};
