use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/* ===== errors ===== */

/// Why a coordination message could not be delivered. Every variant is treated as
/// transient by the sender, which retries on its backoff schedule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SendError {
    Unreachable,
    Timeout,
    /// The peer received the message but refused it, for example because it is at
    /// its task capacity or does not host the base.
    Rejected(String),
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SendError::Unreachable => f.write_str("Unreachable"),
            SendError::Timeout => f.write_str("Timeout"),
            SendError::Rejected(reason) => write!(f, "Rejected - {}", reason),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    // Admission and preparation failures, reported to the submitter.
    NotFound,
    StillActive,
    AlreadyActive,
    CapacityExceeded,
    InvalidReplicaId(u16),
    InvalidBase(String),
    NoMatchingTask,
    ReplicaIdBeingCleaned,
    // Terminal outcomes that are not failures of the task itself.
    Aborted,
    Superseded,
    // Internal failures.
    InvalidState,
    InvalidConfig(String),
    SqliteError,
    SerdeJsonError,
    FsError,
    QueueDisconnected,
    Transport(SendError),
}

impl PartialEq for OperationError {
    fn eq(&self, other: &Self) -> bool {
        // We only compare the kind of error. The payloads are diagnostic and
        // generally we only use the PartialEq for TESTING anyway.
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for OperationError {}

impl Display for OperationError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let mut output = format!("{:?}", self)
            .split("::")
            .last()
            .unwrap_or("")
            .to_string();

        if let Some(msg) = self.message() {
            output += &format!(" - {}", msg);
        };
        f.write_str(&output)
    }
}

impl OperationError {
    /// Return the message associated with the error if there is one.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::NotFound => Some("The replica id is not present in the local update vector.".into()),
            Self::StillActive => Some("The replica id still has an incoming replication agreement. Remove the agreements or use force.".into()),
            Self::AlreadyActive => Some("A clean task for this replica id and base is already active.".into()),
            Self::CapacityExceeded => Some("Exceeded maximum number of active CLEANALLRUV tasks.".into()),
            Self::InvalidReplicaId(_) => None,
            Self::InvalidBase(_) => None,
            Self::NoMatchingTask => None,
            Self::ReplicaIdBeingCleaned => Some("Changes can not be originated by a replica id that is being cleaned.".into()),
            Self::Aborted => None,
            Self::Superseded => Some("A forced clean task took over this replica id and base.".into()),
            Self::InvalidState => None,
            Self::InvalidConfig(_) => None,
            Self::SqliteError => None,
            Self::SerdeJsonError => None,
            Self::FsError => None,
            Self::QueueDisconnected => None,
            Self::Transport(_) => None,
        }
    }
}

impl From<SendError> for OperationError {
    fn from(e: SendError) -> Self {
        OperationError::Transport(e)
    }
}

#[test]
fn test_operationerror_as_nice_string() {
    assert_eq!(
        OperationError::CapacityExceeded.to_string(),
        "CapacityExceeded - Exceeded maximum number of active CLEANALLRUV tasks.".to_string()
    );
    assert_eq!(
        OperationError::InvalidReplicaId(65535).to_string(),
        "InvalidReplicaId(65535)".to_string()
    );
    assert_eq!(
        OperationError::Transport(SendError::Timeout).to_string(),
        "Transport(Timeout)".to_string()
    );
    assert_eq!(OperationError::Aborted.to_string(), "Aborted".to_string());
}

#[test]
fn test_operationerror_eq_is_by_kind() {
    assert_eq!(
        OperationError::InvalidBase("a".into()),
        OperationError::InvalidBase("b".into())
    );
    assert_ne!(OperationError::NotFound, OperationError::StillActive);
}
