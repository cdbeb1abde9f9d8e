//! The backend. This holds the state that must survive a process restart: each base's
//! update vector, the clean and abort task records, the abort intent table, and the
//! outbox of coordination messages still waiting for delivery.
//!
//! Every write is durable once the call returns. Callers rely on this to order a
//! persist before they consider a step complete.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CleanAllRuvConfig;
use crate::prelude::*;

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStateStore;
pub use self::sqlite::SqliteStateStore;

/// The persisted form of a clean task, on the origin or on a participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DbCleanTask {
    pub rid: ReplicaId,
    pub base: String,
    pub role: TaskRole,
    pub force: bool,
    pub certify_all: bool,
    pub origin: ReplicaId,
    pub phase: CleanPhase,
    /// Members that responded while collecting. These must acknowledge the purge.
    pub collected: BTreeSet<ReplicaId>,
    /// Members that did not respond to a forced clean. They are reconciled in the background.
    pub laggards: BTreeSet<ReplicaId>,
    /// Members that have reported the replica id purged.
    pub purged: BTreeSet<ReplicaId>,
    /// The newest change from the replica id that the origin held when preparing.
    pub origin_max: Option<Csn>,
    /// The most recent delivery failure seen by the origin, naming the member.
    #[serde(default)]
    pub last_error: Option<String>,
    pub created: Duration,
}

impl DbCleanTask {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.rid, &self.base)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DbAbortTask {
    pub rid: ReplicaId,
    pub base: String,
    pub certify: bool,
    pub phase: AbortPhase,
    pub acknowledged: BTreeSet<ReplicaId>,
    pub created: Duration,
}

impl DbAbortTask {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.rid, &self.base)
    }
}

/// A recorded intent to abort cleaning of a replica id. This is kept independently of
/// any running clean so that a clean that has not yet started here still sees it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DbAbortIntent {
    pub rid: ReplicaId,
    pub base: String,
    pub certify: bool,
    /// The member that requested the abort, and which collects acknowledgements.
    pub origin: ReplicaId,
    pub created: Duration,
    /// When the abort task holding this intent on this member finished. Unset while
    /// one is still running, or if the intent arrived from another member.
    #[serde(default)]
    pub released: Option<Duration>,
}

impl DbAbortIntent {
    /// The time the retention period counts from.
    pub fn retained_since(&self) -> Duration {
        self.released.unwrap_or(self.created)
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.rid, &self.base)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DbOutboxEntry {
    pub seq: u64,
    pub target: ReplicaId,
    pub msg: CoordinationMessage,
}

pub trait ReplStateStore: Send + Sync {
    fn load_ruv(&self, base: &str) -> Result<Option<BTreeMap<ReplicaId, RuvRange>>, OperationError>;

    fn write_ruv(
        &self,
        base: &str,
        ruv: &BTreeMap<ReplicaId, RuvRange>,
    ) -> Result<(), OperationError>;

    fn list_clean_tasks(&self) -> Result<Vec<DbCleanTask>, OperationError>;

    fn write_clean_task(&self, task: &DbCleanTask) -> Result<(), OperationError>;

    fn delete_clean_task(&self, key: &TaskKey) -> Result<(), OperationError>;

    fn list_abort_tasks(&self) -> Result<Vec<DbAbortTask>, OperationError>;

    fn write_abort_task(&self, task: &DbAbortTask) -> Result<(), OperationError>;

    fn delete_abort_task(&self, key: &TaskKey) -> Result<(), OperationError>;

    fn list_abort_intents(&self) -> Result<Vec<DbAbortIntent>, OperationError>;

    fn write_abort_intent(&self, intent: &DbAbortIntent) -> Result<(), OperationError>;

    fn delete_abort_intent(&self, key: &TaskKey) -> Result<(), OperationError>;

    /// Outbox entries in ascending sequence order.
    fn list_outbox(&self) -> Result<Vec<DbOutboxEntry>, OperationError>;

    fn write_outbox(&self, entry: &DbOutboxEntry) -> Result<(), OperationError>;

    fn delete_outbox(&self, seq: u64) -> Result<(), OperationError>;
}

/// Open the store selected by the configuration.
pub fn open_state_store(
    config: &CleanAllRuvConfig,
) -> Result<Arc<dyn ReplStateStore>, OperationError> {
    match &config.db_path {
        Some(path) => {
            let store = SqliteStateStore::open(path)?;
            Ok(Arc::new(store))
        }
        None => {
            admin_warn!("No db_path configured, clean task state will not survive a restart");
            Ok(Arc::new(MemoryStateStore::default()))
        }
    }
}
