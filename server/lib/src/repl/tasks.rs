//! Process wide bookkeeping of clean and abort instances, and the abort intent table.
//!
//! All admission decisions, and the final decision of how a clean ends, are taken
//! under the one lock. This is what makes an abort that is recorded before a clean
//! concludes always win over that clean.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::be::DbAbortIntent;
use crate::prelude::*;
use crate::repl::status::TaskStatus;

/// How a clean instance ended, as decided by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CleanOutcome {
    Done,
    Aborted,
    Superseded,
}

struct CleanEntry {
    role: TaskRole,
    force: bool,
    generation: u64,
    status: Arc<TaskStatus>,
}

struct AbortEntry {
    status: Arc<TaskStatus>,
    acknowledged: BTreeSet<ReplicaId>,
}

#[derive(Default)]
struct TaskRegistryInner {
    cleans: BTreeMap<TaskKey, CleanEntry>,
    aborts: BTreeMap<TaskKey, AbortEntry>,
    intents: BTreeMap<TaskKey, DbAbortIntent>,
    next_generation: u64,
    rejected: u64,
}

pub struct TaskRegistry {
    max_clean_tasks: usize,
    max_abort_tasks: usize,
    inner: Mutex<TaskRegistryInner>,
    // Bumped whenever a running instance may need to re-check its state.
    signal: watch::Sender<u64>,
}

impl TaskRegistry {
    pub fn new(config: &CleanAllRuvConfig) -> Self {
        let (signal, _) = watch::channel(0);
        TaskRegistry {
            max_clean_tasks: config.max_clean_tasks,
            max_abort_tasks: config.max_abort_tasks,
            inner: Mutex::new(TaskRegistryInner::default()),
            signal,
        }
    }

    fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut TaskRegistryInner) -> T,
    ) -> Result<T, OperationError> {
        let mut guard = self.inner.lock().map_err(|_| {
            admin_error!("task registry mutex poisoned");
            OperationError::InvalidState
        })?;
        Ok(f(&mut guard))
    }

    fn notify(&self) {
        self.signal.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }

    /// Admit an originated clean. A force clean may take over the entry of an active
    /// non-force clean for the same key, which then ends as superseded. Resumed
    /// instances were admitted before the restart and are not checked against the cap.
    pub(crate) fn admit_clean(
        &self,
        key: &TaskKey,
        force: bool,
        resumed: bool,
    ) -> Result<(u64, Arc<TaskStatus>), OperationError> {
        let max = self.max_clean_tasks;
        let (result, superseded) = self.with_inner(|inner| {
            let mut superseded = false;
            if let Some(existing) = inner.cleans.get(key) {
                if !force || existing.force {
                    request_warn!(%key, force, existing_force = existing.force, "clean task already active");
                    return (Err(OperationError::AlreadyActive), false);
                }
                request_info!(%key, "force clean supersedes active clean task");
                // A participant has no driver of its own to observe the takeover.
                if existing.role == TaskRole::Participant {
                    existing.status.finish(TaskExitCode::Superseded);
                }
                superseded = true;
            } else if !resumed && inner.cleans.len() >= max {
                inner.rejected += 1;
                admin_error!(
                    %key,
                    active = inner.cleans.len(),
                    rejected = inner.rejected,
                    "Exceeded maximum number of active CLEANALLRUV tasks"
                );
                return (Err(OperationError::CapacityExceeded), false);
            }

            inner.next_generation += 1;
            let generation = inner.next_generation;
            let status = TaskStatus::new(TaskKind::Clean, key.clone());
            inner.cleans.insert(
                key.clone(),
                CleanEntry {
                    role: TaskRole::Origin,
                    force,
                    generation,
                    status: status.clone(),
                },
            );
            (Ok((generation, status)), superseded)
        })?;

        if superseded {
            self.notify();
        }
        result
    }

    /// Admit a clean driven by another member. Returns false if an entry for this key
    /// already exists, which makes repeated requests idempotent.
    pub(crate) fn admit_participant(
        &self,
        key: &TaskKey,
        force: bool,
        resumed: bool,
    ) -> Result<bool, OperationError> {
        let max = self.max_clean_tasks;
        self.with_inner(|inner| {
            if inner.cleans.contains_key(key) {
                return Ok(false);
            }
            if !resumed && inner.cleans.len() >= max {
                inner.rejected += 1;
                admin_error!(
                    %key,
                    active = inner.cleans.len(),
                    rejected = inner.rejected,
                    "Exceeded maximum number of active CLEANALLRUV tasks"
                );
                return Err(OperationError::CapacityExceeded);
            }
            inner.next_generation += 1;
            let status = TaskStatus::new(TaskKind::Clean, key.clone());
            status.set_phase(CleanPhase::Collecting);
            status.set_status("participating");
            inner.cleans.insert(
                key.clone(),
                CleanEntry {
                    role: TaskRole::Participant,
                    force,
                    generation: inner.next_generation,
                    status,
                },
            );
            Ok(true)
        })?
    }

    /// Remove an origin entry that never got past preparation.
    pub(crate) fn release_clean(&self, key: &TaskKey, generation: u64) -> Result<(), OperationError> {
        self.with_inner(|inner| {
            if inner
                .cleans
                .get(key)
                .map(|e| e.generation == generation)
                .unwrap_or(false)
            {
                inner.cleans.remove(key);
            }
        })
    }

    /// Remove a participant entry, finishing its status with `code`. Returns true if a
    /// participant entry was present.
    pub(crate) fn drop_participant(
        &self,
        key: &TaskKey,
        code: TaskExitCode,
    ) -> Result<bool, OperationError> {
        self.with_inner(|inner| {
            let is_participant = inner
                .cleans
                .get(key)
                .map(|e| e.role == TaskRole::Participant)
                .unwrap_or(false);
            if is_participant {
                if let Some(entry) = inner.cleans.remove(key) {
                    entry.status.finish(code);
                }
            }
            is_participant
        })
    }

    /// Has this instance been superseded, or has an abort been recorded for it?
    pub(crate) fn check_clean(
        &self,
        key: &TaskKey,
        generation: u64,
    ) -> Result<Option<CleanOutcome>, OperationError> {
        self.with_inner(|inner| {
            let current = inner
                .cleans
                .get(key)
                .map(|e| e.generation == generation)
                .unwrap_or(false);
            if !current {
                Some(CleanOutcome::Superseded)
            } else if inner.intents.contains_key(key) {
                Some(CleanOutcome::Aborted)
            } else {
                None
            }
        })
    }

    /// Decide how an origin instance ends and release its entry.
    pub(crate) fn finish_clean(
        &self,
        key: &TaskKey,
        generation: u64,
    ) -> Result<CleanOutcome, OperationError> {
        self.with_inner(|inner| {
            let current = inner
                .cleans
                .get(key)
                .map(|e| e.generation == generation)
                .unwrap_or(false);
            if !current {
                return CleanOutcome::Superseded;
            }
            inner.cleans.remove(key);
            if inner.intents.contains_key(key) {
                CleanOutcome::Aborted
            } else {
                CleanOutcome::Done
            }
        })
    }

    pub(crate) fn admit_abort(
        &self,
        key: &TaskKey,
        acknowledged: BTreeSet<ReplicaId>,
        resumed: bool,
    ) -> Result<Arc<TaskStatus>, OperationError> {
        let max = self.max_abort_tasks;
        self.with_inner(|inner| {
            if inner.aborts.contains_key(key) {
                request_warn!(%key, "abort task already active");
                return Err(OperationError::AlreadyActive);
            }
            if !resumed && inner.aborts.len() >= max {
                inner.rejected += 1;
                admin_error!(
                    %key,
                    active = inner.aborts.len(),
                    "Exceeded maximum number of active abort tasks"
                );
                return Err(OperationError::CapacityExceeded);
            }
            let status = TaskStatus::new(TaskKind::Abort, key.clone());
            inner.aborts.insert(
                key.clone(),
                AbortEntry {
                    status: status.clone(),
                    acknowledged,
                },
            );
            Ok(status)
        })?
    }

    /// Record that `from` has abandoned cleaning for `key`. Returns true if this is
    /// new information for an active abort.
    pub(crate) fn record_abort_ack(
        &self,
        key: &TaskKey,
        from: ReplicaId,
    ) -> Result<bool, OperationError> {
        let fresh = self.with_inner(|inner| {
            inner
                .aborts
                .get_mut(key)
                .map(|e| e.acknowledged.insert(from))
                .unwrap_or(false)
        })?;
        if fresh {
            self.notify();
        }
        Ok(fresh)
    }

    pub(crate) fn abort_acks(&self, key: &TaskKey) -> Result<BTreeSet<ReplicaId>, OperationError> {
        self.with_inner(|inner| {
            inner
                .aborts
                .get(key)
                .map(|e| e.acknowledged.clone())
                .unwrap_or_default()
        })
    }

    /// Release an abort entry. The retention of its intent counts from `now`, and the
    /// stamped intent is returned for the caller to persist.
    pub(crate) fn finish_abort(
        &self,
        key: &TaskKey,
        now: Duration,
    ) -> Result<Option<DbAbortIntent>, OperationError> {
        self.with_inner(|inner| {
            inner.aborts.remove(key)?;
            let intent = inner.intents.get_mut(key)?;
            intent.released = Some(now);
            Some(intent.clone())
        })
    }

    /// Returns true if no intent was held for this key.
    pub(crate) fn insert_intent(&self, intent: DbAbortIntent) -> Result<bool, OperationError> {
        let fresh = self.with_inner(|inner| {
            let key = intent.key();
            if inner.intents.contains_key(&key) {
                false
            } else {
                inner.intents.insert(key, intent);
                true
            }
        })?;
        if fresh {
            self.notify();
        }
        Ok(fresh)
    }

    pub(crate) fn has_intent(&self, key: &TaskKey) -> Result<bool, OperationError> {
        self.with_inner(|inner| inner.intents.contains_key(key))
    }

    /// Forget intents that no active abort task holds, once `ttl` has passed since the
    /// abort holding them finished, or since they arrived.
    pub(crate) fn expire_intents(
        &self,
        now: Duration,
        ttl: Duration,
    ) -> Result<Vec<TaskKey>, OperationError> {
        self.with_inner(|inner| {
            let expired: Vec<TaskKey> = inner
                .intents
                .iter()
                .filter(|(key, intent)| {
                    !inner.aborts.contains_key(*key)
                        && now.saturating_sub(intent.retained_since()) >= ttl
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired.iter() {
                inner.intents.remove(key);
            }
            expired
        })
    }

    pub fn active_clean_count(&self) -> usize {
        self.with_inner(|inner| inner.cleans.len()).unwrap_or(0)
    }

    pub fn active_abort_count(&self) -> usize {
        self.with_inner(|inner| inner.aborts.len()).unwrap_or(0)
    }

    /// How many submissions have been refused for capacity since this server started.
    pub fn rejected_count(&self) -> u64 {
        self.with_inner(|inner| inner.rejected).unwrap_or(0)
    }

    pub(crate) fn clean_status(&self, key: &TaskKey) -> Option<(TaskRole, Arc<TaskStatus>)> {
        self.with_inner(|inner| inner.cleans.get(key).map(|e| (e.role, e.status.clone())))
            .ok()
            .flatten()
    }

    pub(crate) fn abort_status(&self, key: &TaskKey) -> Option<Arc<TaskStatus>> {
        self.with_inner(|inner| inner.aborts.get(key).map(|e| e.status.clone()))
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::{CleanOutcome, TaskRegistry};
    use crate::be::DbAbortIntent;
    use crate::prelude::*;
    use std::collections::BTreeSet;

    const BASE: &str = "dc=example,dc=com";

    fn key(rid: u16) -> TaskKey {
        TaskKey::new(ReplicaId(rid), BASE)
    }

    fn intent(rid: u16, created: u64) -> DbAbortIntent {
        DbAbortIntent {
            rid: ReplicaId(rid),
            base: BASE.to_string(),
            certify: false,
            origin: ReplicaId(1),
            created: Duration::from_secs(created),
            released: None,
        }
    }

    #[test]
    fn test_admission_cap_counts_participants() {
        sketching::test_init();
        let config = CleanAllRuvConfig {
            max_clean_tasks: 3,
            ..Default::default()
        };
        let tasks = TaskRegistry::new(&config);

        tasks.admit_clean(&key(10), false, false).expect("admit");
        assert_eq!(tasks.admit_participant(&key(11), false, false), Ok(true));
        // Repeats are idempotent and do not consume capacity.
        assert_eq!(tasks.admit_participant(&key(11), false, false), Ok(false));
        tasks.admit_clean(&key(12), true, false).expect("admit");

        assert_eq!(
            tasks.admit_clean(&key(13), false, false).map(|_| ()),
            Err(OperationError::CapacityExceeded)
        );
        assert_eq!(
            tasks.admit_participant(&key(13), false, false),
            Err(OperationError::CapacityExceeded)
        );
        assert_eq!(tasks.rejected_count(), 2);
        // Resumed instances were admitted before a restart and bypass the cap.
        assert!(tasks.admit_clean(&key(14), false, true).is_ok());
        assert_eq!(tasks.active_clean_count(), 4);
    }

    #[test]
    fn test_force_supersedes_non_force_only() {
        sketching::test_init();
        let tasks = TaskRegistry::new(&CleanAllRuvConfig::default());

        let (first, _) = tasks.admit_clean(&key(4), false, false).expect("admit");
        assert_eq!(
            tasks.admit_clean(&key(4), false, false).map(|_| ()),
            Err(OperationError::AlreadyActive)
        );
        let (second, _) = tasks.admit_clean(&key(4), true, false).expect("admit");
        assert_eq!(
            tasks.admit_clean(&key(4), true, false).map(|_| ()),
            Err(OperationError::AlreadyActive)
        );

        assert_eq!(
            tasks.check_clean(&key(4), first),
            Ok(Some(CleanOutcome::Superseded))
        );
        assert_eq!(tasks.check_clean(&key(4), second), Ok(None));
        // The superseded instance must not release its successor.
        assert_eq!(
            tasks.finish_clean(&key(4), first),
            Ok(CleanOutcome::Superseded)
        );
        assert_eq!(tasks.active_clean_count(), 1);
        assert_eq!(tasks.finish_clean(&key(4), second), Ok(CleanOutcome::Done));
        assert_eq!(tasks.active_clean_count(), 0);
    }

    #[test]
    fn test_intent_makes_clean_abort() {
        sketching::test_init();
        let tasks = TaskRegistry::new(&CleanAllRuvConfig::default());
        let signal = tasks.subscribe();

        let (generation, _) = tasks.admit_clean(&key(4), false, false).expect("admit");
        assert_eq!(tasks.insert_intent(intent(4, 100)), Ok(true));
        assert_eq!(tasks.insert_intent(intent(4, 100)), Ok(false));
        assert!(signal.has_changed().expect("signal"));

        assert_eq!(
            tasks.check_clean(&key(4), generation),
            Ok(Some(CleanOutcome::Aborted))
        );
        assert_eq!(
            tasks.finish_clean(&key(4), generation),
            Ok(CleanOutcome::Aborted)
        );
    }

    #[test]
    fn test_intents_expire_once_unheld() {
        sketching::test_init();
        let tasks = TaskRegistry::new(&CleanAllRuvConfig::default());
        let ttl = Duration::from_secs(300);

        tasks.insert_intent(intent(4, 100)).expect("insert");
        tasks.insert_intent(intent(5, 100)).expect("insert");
        tasks
            .admit_abort(&key(5), BTreeSet::new(), false)
            .expect("admit");

        assert!(tasks
            .expire_intents(Duration::from_secs(200), ttl)
            .expect("expire")
            .is_empty());
        // Only the intent without an active abort task expires.
        assert_eq!(
            tasks.expire_intents(Duration::from_secs(400), ttl),
            Ok(vec![key(4)])
        );
        assert_eq!(tasks.has_intent(&key(5)), Ok(true));

        assert_eq!(tasks.record_abort_ack(&key(5), ReplicaId(2)), Ok(true));
        assert_eq!(tasks.record_abort_ack(&key(5), ReplicaId(2)), Ok(false));
        assert_eq!(
            tasks.abort_acks(&key(5)),
            Ok(BTreeSet::from([ReplicaId(2)]))
        );
        tasks
            .finish_abort(&key(5), Duration::from_secs(350))
            .expect("finish");
        assert_eq!(
            tasks.expire_intents(Duration::from_secs(700), ttl),
            Ok(vec![key(5)])
        );
    }

    #[test]
    fn test_intent_retained_after_long_abort_finishes() {
        sketching::test_init();
        let tasks = TaskRegistry::new(&CleanAllRuvConfig::default());
        let ttl = Duration::from_secs(300);

        tasks
            .admit_abort(&key(6), BTreeSet::new(), false)
            .expect("admit");
        tasks.insert_intent(intent(6, 100)).expect("insert");

        // The abort ran far longer than the ttl. Its intent is kept for a full ttl
        // after it ends.
        let stamped = tasks
            .finish_abort(&key(6), Duration::from_secs(5000))
            .expect("finish")
            .expect("intent held");
        assert_eq!(stamped.released, Some(Duration::from_secs(5000)));
        assert!(tasks
            .expire_intents(Duration::from_secs(5001), ttl)
            .expect("expire")
            .is_empty());
        assert_eq!(tasks.has_intent(&key(6)), Ok(true));
        assert_eq!(
            tasks.expire_intents(Duration::from_secs(5300), ttl),
            Ok(vec![key(6)])
        );

        // Without an abort entry there is nothing to stamp.
        assert_eq!(tasks.finish_abort(&key(6), Duration::from_secs(5400)), Ok(None));
    }
}
