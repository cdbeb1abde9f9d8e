use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{REPLICA_ID_MAX, REPLICA_ID_MIN};

/// The identity a replica stamps on every change it originates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ReplicaId(pub u16);

impl ReplicaId {
    /// Is this id within the range that may be assigned to a writeable replica?
    pub fn is_assignable(self) -> bool {
        (REPLICA_ID_MIN..=REPLICA_ID_MAX).contains(&self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ReplicaId {
    fn from(v: u16) -> Self {
        ReplicaId(v)
    }
}

/// A change sequence number. Identifies a single replicated change, and orders changes
/// first by time then by the replica that originated them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Csn {
    // Mental note: Derive ord always checks in order of struct fields.
    pub ts: Duration,
    pub rid: ReplicaId,
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032}-{:05}", self.ts.as_nanos(), self.rid.0)
    }
}

impl Csn {
    pub fn new(rid: ReplicaId, ts: Duration) -> Self {
        Csn { ts, rid }
    }

    /// Create the next csn for `rid`, stepping past `max_ts` if the clock has not
    /// advanced beyond it.
    pub fn new_lamport(rid: ReplicaId, ts: Duration, max_ts: &Duration) -> Self {
        let ts = if ts > *max_ts {
            ts
        } else {
            *max_ts + Duration::from_nanos(1)
        };
        Csn { ts, rid }
    }
}

/// The range of changes a replica id has contributed, as observed by the holder
/// of an update vector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuvRange {
    pub csn_min: Csn,
    pub csn_max: Csn,
}

/// The inter-replica wire contract. Receivers must handle every message idempotently
/// since delivery is at least once.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationMessage {
    ReplicaIdCleaningStarted {
        rid: ReplicaId,
        base: String,
        force: bool,
        origin: ReplicaId,
    },
    /// Sent once the origin has purged `rid` from its own update vector. `purged_max`
    /// is the highest change of `rid` the origin held when it purged.
    ReplicaIdCleaned {
        rid: ReplicaId,
        base: String,
        origin: ReplicaId,
        purged_max: Option<Csn>,
    },
    AbortCleaning {
        rid: ReplicaId,
        base: String,
        certify: bool,
        origin: ReplicaId,
    },
    AbortAcknowledged {
        rid: ReplicaId,
        base: String,
        from: ReplicaId,
    },
}

impl CoordinationMessage {
    pub fn rid(&self) -> ReplicaId {
        match self {
            CoordinationMessage::ReplicaIdCleaningStarted { rid, .. }
            | CoordinationMessage::ReplicaIdCleaned { rid, .. }
            | CoordinationMessage::AbortCleaning { rid, .. }
            | CoordinationMessage::AbortAcknowledged { rid, .. } => *rid,
        }
    }

    pub fn base(&self) -> &str {
        match self {
            CoordinationMessage::ReplicaIdCleaningStarted { base, .. }
            | CoordinationMessage::ReplicaIdCleaned { base, .. }
            | CoordinationMessage::AbortCleaning { base, .. }
            | CoordinationMessage::AbortAcknowledged { base, .. } => base.as_str(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoordinationMessage::ReplicaIdCleaningStarted { .. } => "replica_id_cleaning_started",
            CoordinationMessage::ReplicaIdCleaned { .. } => "replica_id_cleaned",
            CoordinationMessage::AbortCleaning { .. } => "abort_cleaning",
            CoordinationMessage::AbortAcknowledged { .. } => "abort_acknowledged",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationResponse {
    Ack,
    /// The member has marked the replica id as being cleaned. `max_csn` is the newest
    /// change from that replica id the member has applied.
    CleaningStarted { max_csn: Option<Csn> },
    /// The replica id is no longer present in the member's update vector.
    Purged,
    /// The member holds an abort intent for this replica id and base.
    Aborting,
}
