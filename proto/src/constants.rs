//! Because consistency is great!

/// The highest number of clean tasks (originated or participating) a single server will
/// track at once.
pub const DEFAULT_MAX_CLEAN_TASKS: usize = 64;
/// The highest number of abort tasks a single server will run at once.
pub const DEFAULT_MAX_ABORT_TASKS: usize = 64;

/// First retry delay after a member fails to respond.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
/// Retry delays double until they reach this ceiling.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
/// How long a sender waits for a reply before treating the member as timed out.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 30_000;
/// Percentage of known-reachable members that must respond before a forced clean
/// may leave the collecting phase.
pub const DEFAULT_FORCE_QUORUM_PERCENT: u8 = 51;
/// How long an abort intent outlives its abort task, so that late arriving clean
/// requests for the same replica id are still refused.
pub const DEFAULT_ABORT_INTENT_TTL_SECS: u64 = 300;

/// Replica id 0 is never assigned.
pub const REPLICA_ID_MIN: u16 = 1;
/// Replica id 65535 is reserved for read only consumers, which never originate changes
/// and so never appear in an update vector.
pub const REPLICA_ID_MAX: u16 = 65534;
