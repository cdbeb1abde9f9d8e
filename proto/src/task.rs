use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OperationError;
use crate::message::ReplicaId;

/// Clean and abort tasks are unique per replica id and replicated base.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub rid: ReplicaId,
    pub base: String,
}

impl TaskKey {
    pub fn new(rid: ReplicaId, base: &str) -> Self {
        TaskKey {
            rid,
            base: base.to_string(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rid, self.base)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Clean,
    Abort,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Clean => f.write_str("clean"),
            TaskKind::Abort => f.write_str("abort"),
        }
    }
}

/// Whether this server drives the task, or only takes part in a task driven by
/// another member.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskRole {
    Origin,
    Participant,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CleanPhase {
    Preparing,
    Collecting,
    Releasing,
    Cleaning,
    Done,
    Aborted,
}

impl CleanPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, CleanPhase::Done | CleanPhase::Aborted)
    }
}

impl fmt::Display for CleanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CleanPhase::Preparing => "preparing",
            CleanPhase::Collecting => "collecting",
            CleanPhase::Releasing => "releasing",
            CleanPhase::Cleaning => "cleaning",
            CleanPhase::Done => "done",
            CleanPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AbortPhase {
    Requested,
    Propagating,
    Confirmed,
}

impl fmt::Display for AbortPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortPhase::Requested => "requested",
            AbortPhase::Propagating => "propagating",
            AbortPhase::Confirmed => "confirmed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskExitCode {
    Success,
    Aborted,
    Superseded,
    Failed(OperationError),
}

impl TaskExitCode {
    /// The numeric exit code as reported on the task entry. Zero is success.
    pub fn as_code(&self) -> i32 {
        match self {
            TaskExitCode::Success => 0,
            TaskExitCode::Aborted => 1,
            TaskExitCode::Superseded => 2,
            TaskExitCode::Failed(_) => -1,
        }
    }
}

/// A point in time view of a task, in the shape an administrator polls for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskStatusSnapshot {
    pub kind: TaskKind,
    pub key: TaskKey,
    pub phase: String,
    pub log: Vec<String>,
    pub status: String,
    pub exit_code: Option<TaskExitCode>,
    pub current_item: u64,
    pub total_items: u64,
    /// The most recent delivery failure, naming the member it came from.
    pub last_error: Option<String>,
    /// Set while some member keeps rejecting this task's requests.
    pub stalled: bool,
}

impl TaskStatusSnapshot {
    pub fn is_done(&self) -> bool {
        self.exit_code.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_display_and_order() {
        let a = TaskKey::new(ReplicaId(4), "dc=example,dc=com");
        let b = TaskKey::new(ReplicaId(10), "dc=example,dc=com");
        assert_eq!(a.to_string(), "4:dc=example,dc=com");
        assert!(a < b);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TaskExitCode::Success.as_code(), 0);
        assert_eq!(TaskExitCode::Aborted.as_code(), 1);
        assert_eq!(
            TaskExitCode::Failed(OperationError::NotFound).as_code(),
            -1
        );
        assert!(CleanPhase::Aborted.is_terminal());
        assert!(!CleanPhase::Releasing.is_terminal());
    }
}
