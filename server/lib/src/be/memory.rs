use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{DbAbortIntent, DbAbortTask, DbCleanTask, DbOutboxEntry};
use crate::prelude::*;

#[derive(Default)]
struct MemoryInner {
    ruv: BTreeMap<String, BTreeMap<ReplicaId, RuvRange>>,
    clean: BTreeMap<TaskKey, DbCleanTask>,
    abort: BTreeMap<TaskKey, DbAbortTask>,
    intent: BTreeMap<TaskKey, DbAbortIntent>,
    outbox: BTreeMap<u64, DbOutboxEntry>,
}

/// A store that lives as long as the process. A node restarted against the same
/// instance observes exactly the state a restart from disk would.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> Result<T, OperationError> {
        let mut guard = self.inner.lock().map_err(|_| {
            admin_error!("memory state store mutex poisoned");
            OperationError::InvalidState
        })?;
        Ok(f(&mut guard))
    }
}

impl ReplStateStore for MemoryStateStore {
    fn load_ruv(&self, base: &str) -> Result<Option<BTreeMap<ReplicaId, RuvRange>>, OperationError> {
        self.with_inner(|inner| inner.ruv.get(base).cloned())
    }

    fn write_ruv(
        &self,
        base: &str,
        ruv: &BTreeMap<ReplicaId, RuvRange>,
    ) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.ruv.insert(base.to_string(), ruv.clone());
        })
    }

    fn list_clean_tasks(&self) -> Result<Vec<DbCleanTask>, OperationError> {
        self.with_inner(|inner| inner.clean.values().cloned().collect())
    }

    fn write_clean_task(&self, task: &DbCleanTask) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.clean.insert(task.key(), task.clone());
        })
    }

    fn delete_clean_task(&self, key: &TaskKey) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.clean.remove(key);
        })
    }

    fn list_abort_tasks(&self) -> Result<Vec<DbAbortTask>, OperationError> {
        self.with_inner(|inner| inner.abort.values().cloned().collect())
    }

    fn write_abort_task(&self, task: &DbAbortTask) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.abort.insert(task.key(), task.clone());
        })
    }

    fn delete_abort_task(&self, key: &TaskKey) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.abort.remove(key);
        })
    }

    fn list_abort_intents(&self) -> Result<Vec<DbAbortIntent>, OperationError> {
        self.with_inner(|inner| inner.intent.values().cloned().collect())
    }

    fn write_abort_intent(&self, intent: &DbAbortIntent) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.intent.insert(intent.key(), intent.clone());
        })
    }

    fn delete_abort_intent(&self, key: &TaskKey) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.intent.remove(key);
        })
    }

    fn list_outbox(&self) -> Result<Vec<DbOutboxEntry>, OperationError> {
        self.with_inner(|inner| inner.outbox.values().cloned().collect())
    }

    fn write_outbox(&self, entry: &DbOutboxEntry) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.outbox.insert(entry.seq, entry.clone());
        })
    }

    fn delete_outbox(&self, seq: u64) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            inner.outbox.remove(&seq);
        })
    }
}
