//! The CLEANALLRUV engine. This implements removal of a decommissioned replica id from the
//! update vector of every surviving member of a multi-master topology, without taking any
//! member offline and without a central coordinator.
//!
//! The replicated store, the wire transport and the administrative protocol framing are
//! collaborators supplied by the embedding server through the [`be::ReplStateStore`] and
//! [`repl::channel::ReplTransport`] traits.

#![deny(warnings)]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;

pub mod be;
pub mod config;
pub mod repl;
pub mod testkit;
pub(crate) mod utils;

/// A prelude of imports that should be imported by all other modules to
/// help make imports cleaner.
pub mod prelude {
    pub use cleanallruv_proto::constants::*;
    pub use cleanallruv_proto::{
        AbortPhase, CleanPhase, CoordinationMessage, CoordinationResponse, Csn,
        OperationError, ReplicaId, RuvRange, SendError, TaskExitCode, TaskKey, TaskKind,
        TaskRole, TaskStatusSnapshot,
    };
    pub use sketching::{
        admin_debug, admin_error, admin_info, admin_warn, perf_trace, request_error,
        request_info, request_trace, request_warn, tagged_event, task_error, task_info,
        task_trace, task_warn, EventTag,
    };
    pub use std::time::Duration;
    pub use url::Url;

    pub use crate::be::ReplStateStore;
    pub use crate::config::CleanAllRuvConfig;
    pub use crate::repl::node::ReplicaNode;
    pub use crate::repl::registry::ReplicaRegistry;
    pub use crate::repl::status::TaskHandle;
    pub use crate::utils::duration_from_epoch_now;
}
