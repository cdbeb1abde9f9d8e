//! A single replica. The node owns the update vectors of the bases it hosts, receives
//! coordination messages from other members, and drives the clean and abort tasks
//! submitted to it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::be::{DbAbortIntent, DbAbortTask, DbCleanTask};
use crate::prelude::*;
use crate::repl::abort::AbortTask;
use crate::repl::channel::{PropagationChannel, ReplTransport};
use crate::repl::clean::CleanTask;
use crate::repl::ruv::{ReplicationUpdateVector, ReplicationUpdateVectorTransaction};
use crate::repl::status::TaskStatus;
use crate::repl::tasks::TaskRegistry;
use crate::repl::CoreAction;

#[derive(Default)]
struct Markers {
    // Replica ids this node has agreed to stop accepting new local writes for.
    being_cleaned: BTreeSet<TaskKey>,
    // Replica ids purged since this node started. Updates carrying them are dropped.
    purged: BTreeSet<TaskKey>,
}

pub struct ReplicaNode {
    rid: ReplicaId,
    pub(crate) config: CleanAllRuvConfig,
    ruvs: BTreeMap<String, ReplicationUpdateVector>,
    pub(crate) registry: Arc<ReplicaRegistry>,
    pub(crate) channel: PropagationChannel,
    pub(crate) store: Arc<dyn ReplStateStore>,
    pub(crate) tasks: TaskRegistry,
    markers: Mutex<Markers>,
    shutdown: broadcast::Sender<CoreAction>,
    stopped: AtomicBool,
}

impl ReplicaNode {
    /// Start a node hosting `bases`, restoring whatever a previous run left in `store`.
    /// Persisted clean and abort tasks resume from their last completed phase.
    pub async fn start(
        rid: ReplicaId,
        bases: &[&str],
        config: CleanAllRuvConfig,
        registry: Arc<ReplicaRegistry>,
        transport: Arc<dyn ReplTransport>,
        store: Arc<dyn ReplStateStore>,
    ) -> Result<Arc<Self>, OperationError> {
        config.validate()?;
        if !rid.is_assignable() {
            admin_error!(%rid, "replica id is not assignable to a writeable replica");
            return Err(OperationError::InvalidReplicaId(rid.0));
        }

        let ruvs = bases
            .iter()
            .map(|base| {
                ReplicationUpdateVector::load(base, store.as_ref())
                    .map(|ruv| (base.to_string(), ruv))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let (shutdown, _) = broadcast::channel(4);
        let channel = PropagationChannel::new(
            rid,
            &config,
            transport,
            registry.clone(),
            store.clone(),
            shutdown.clone(),
        )?;
        let tasks = TaskRegistry::new(&config);

        let node = Arc::new(ReplicaNode {
            rid,
            config,
            ruvs,
            registry,
            channel,
            store,
            tasks,
            markers: Mutex::new(Markers::default()),
            shutdown,
            stopped: AtomicBool::new(false),
        });

        node.restore()?;
        admin_info!(%rid, bases = ?bases, "replica node started");
        Ok(node)
    }

    fn restore(self: &Arc<Self>) -> Result<(), OperationError> {
        let intents = self.store.list_abort_intents()?;
        admin_debug!(rid = %self.rid, intents = intents.len(), "loading abort intents");
        for intent in intents {
            self.tasks.insert_intent(intent)?;
        }

        let restored = self.channel.restore_outbox()?;
        if restored > 0 {
            admin_info!(restored, "restored undelivered coordination messages");
        }

        for record in self.store.list_clean_tasks()? {
            let key = record.key();
            if !self.ruvs.contains_key(&record.base) {
                admin_warn!(%key, "persisted clean task for a base this node does not host");
                continue;
            }
            match record.role {
                TaskRole::Participant => {
                    self.tasks.admit_participant(&key, record.force, true)?;
                    self.with_markers(|m| m.being_cleaned.insert(key.clone()))?;
                }
                TaskRole::Origin => {
                    if record.phase.is_terminal() {
                        self.store.delete_clean_task(&key)?;
                        continue;
                    }
                    let (generation, status) = self.tasks.admit_clean(&key, record.force, true)?;
                    admin_info!(%key, phase = %record.phase, force = record.force, "Resuming clean task");
                    status.log(format!("Resuming clean task in phase {}", record.phase));
                    status.set_phase(record.phase);
                    self.with_markers(|m| m.being_cleaned.insert(key.clone()))?;
                    self.spawn_clean(record, generation, status);
                }
            }
        }

        for record in self.store.list_abort_tasks()? {
            let key = record.key();
            let status = self
                .tasks
                .admit_abort(&key, record.acknowledged.clone(), true)?;
            let pending = if record.certify {
                self.abort_required(record.rid)
                    .difference(&record.acknowledged)
                    .count()
            } else {
                0
            };
            admin_warn!(
                %key,
                phase = %record.phase,
                certify = record.certify,
                pending_acks = pending,
                "Resuming abort task"
            );
            status.log(format!(
                "Resuming abort task in phase {}, waiting on {} members",
                record.phase, pending
            ));
            status.set_phase(record.phase);
            self.spawn_abort(record, status);
        }
        Ok(())
    }

    /// Stop every worker of this node. Persisted state is untouched, so a node started
    /// against the same store carries on where this one left off.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown.send(CoreAction::Shutdown);
        self.channel.stop();
        admin_info!(rid = %self.rid, "replica node stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn rid(&self) -> ReplicaId {
        self.rid
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<CoreAction> {
        self.shutdown.subscribe()
    }

    fn with_markers<T>(&self, f: impl FnOnce(&mut Markers) -> T) -> Result<T, OperationError> {
        let mut guard = self.markers.lock().map_err(|_| {
            admin_error!("marker mutex poisoned");
            OperationError::InvalidState
        })?;
        Ok(f(&mut guard))
    }

    fn ruv(&self, base: &str) -> Result<&ReplicationUpdateVector, OperationError> {
        self.ruvs.get(base).ok_or_else(|| {
            request_warn!(%base, "base is not hosted by this node");
            OperationError::InvalidBase(base.to_string())
        })
    }

    fn validate_target(&self, rid: ReplicaId) -> Result<(), OperationError> {
        if !rid.is_assignable() || rid == self.rid {
            request_warn!(%rid, "replica id can not be cleaned from this node");
            return Err(OperationError::InvalidReplicaId(rid.0));
        }
        Ok(())
    }

    fn expire_intents(&self) -> Result<(), OperationError> {
        let expired = self
            .tasks
            .expire_intents(duration_from_epoch_now(), self.config.abort_intent_ttl())?;
        for key in expired {
            self.store.delete_abort_intent(&key)?;
            admin_info!(%key, "abort intent expired");
        }
        Ok(())
    }

    /// The current update vector of `base`.
    pub fn ruv_range(&self, base: &str) -> Result<BTreeMap<ReplicaId, RuvRange>, OperationError> {
        Ok(self.ruv(base)?.read().current_ruv_range())
    }

    pub fn contains_replica_id(&self, base: &str, rid: ReplicaId) -> Result<bool, OperationError> {
        Ok(self.ruv(base)?.read().contains_replica_id(rid))
    }

    pub fn is_being_cleaned(&self, rid: ReplicaId, base: &str) -> bool {
        let key = TaskKey::new(rid, base);
        self.with_markers(|m| m.being_cleaned.contains(&key))
            .unwrap_or(false)
    }

    fn is_purged(&self, key: &TaskKey) -> Result<bool, OperationError> {
        self.with_markers(|m| m.purged.contains(key))
    }

    /// Apply a change replicated from another member. Changes from a replica id purged
    /// since this node started are discarded, returning false.
    pub fn apply_update(&self, base: &str, csn: Csn) -> Result<bool, OperationError> {
        let ruv = self.ruv(base)?;
        // Checked under the write txn, which a purge holds until its marker is set.
        let mut wr = ruv.write();
        if self.is_purged(&TaskKey::new(csn.rid, base))? {
            request_info!(%csn, %base, "discarding update from a purged replica id");
            return Ok(false);
        }
        wr.insert_change(csn);
        wr.commit(self.store.as_ref())?;
        Ok(true)
    }

    /// Record a change written on this node.
    pub fn originate_change(&self, base: &str) -> Result<Csn, OperationError> {
        let ruv = self.ruv(base)?;
        if self.is_being_cleaned(self.rid, base) {
            request_error!(rid = %self.rid, %base, "refusing local write, this replica id is being cleaned");
            return Err(OperationError::ReplicaIdBeingCleaned);
        }
        let mut wr = ruv.write();
        let max_ts = wr.max_csn(self.rid).map(|c| c.ts).unwrap_or_default();
        let csn = Csn::new_lamport(self.rid, duration_from_epoch_now(), &max_ts);
        wr.insert_change(csn);
        wr.commit(self.store.as_ref())?;
        Ok(csn)
    }

    /// Remove `rid` from the update vector of `base`, persisting before the removal is
    /// visible. Returns true if it was present.
    pub(crate) fn purge_replica_id(&self, base: &str, rid: ReplicaId) -> Result<bool, OperationError> {
        let ruv = self.ruv(base)?;
        let key = TaskKey::new(rid, base);
        let mut wr = ruv.write();
        let removed = wr.remove_replica_id(rid);
        // The marker is set before the txn is released so no update can slip in between.
        let newly_marked = self.with_markers(|m| m.purged.insert(key.clone()))?;
        if let Err(e) = wr.commit(self.store.as_ref()) {
            if newly_marked {
                self.with_markers(|m| m.purged.remove(&key))?;
            }
            return Err(e);
        }

        self.with_markers(|m| m.being_cleaned.remove(&key))?;
        if removed {
            admin_info!(%key, "replica id purged from update vector");
        }
        Ok(removed)
    }

    /// Members that must acknowledge a certified abort of `rid`.
    pub(crate) fn abort_required(&self, rid: ReplicaId) -> BTreeSet<ReplicaId> {
        let mut required = self.registry.members();
        required.remove(&self.rid);
        required.remove(&rid);
        required
    }

    /// Record an abort intent. Returns false if one was already held.
    pub(crate) fn record_abort_intent(&self, intent: DbAbortIntent) -> Result<bool, OperationError> {
        let key = intent.key();
        if self.tasks.has_intent(&key)? {
            return Ok(false);
        }
        self.store.write_abort_intent(&intent)?;
        self.tasks.insert_intent(intent)?;
        request_info!(%key, "recorded abort intent");
        Ok(true)
    }

    /// Stop taking part in a clean driven by another member.
    pub(crate) fn abandon_participant(&self, key: &TaskKey) -> Result<(), OperationError> {
        if self.tasks.drop_participant(key, TaskExitCode::Aborted)? {
            self.store.delete_clean_task(key)?;
            self.with_markers(|m| m.being_cleaned.remove(key))?;
            request_info!(%key, "abandoned participation in clean task");
        }
        Ok(())
    }

    /// Release the abort entry for `key`, persisting when its intent stops being held.
    pub(crate) fn release_abort(&self, key: &TaskKey) -> Result<(), OperationError> {
        if let Some(intent) = self.tasks.finish_abort(key, duration_from_epoch_now())? {
            self.store.write_abort_intent(&intent)?;
        }
        Ok(())
    }

    pub(crate) fn clear_being_cleaned(&self, key: &TaskKey) -> Result<(), OperationError> {
        self.with_markers(|m| {
            m.being_cleaned.remove(key);
        })
    }

    /// Relay `msg` along this node's outgoing agreements, skipping members that already
    /// have it or that are being removed.
    fn relay(
        &self,
        msg: &CoordinationMessage,
        skip: &[ReplicaId],
    ) -> Result<(), OperationError> {
        let targets: Vec<ReplicaId> = self
            .registry
            .agreements_from(self.rid)
            .into_iter()
            .filter(|t| *t != self.rid && !skip.contains(t))
            .collect();
        for target in targets {
            self.channel.enqueue_durable(target, msg.clone())?;
        }
        Ok(())
    }

    /// Submit a clean of `rid` from `base`, driven by this node.
    ///
    /// Preparation happens before this returns, so `NotFound` and `StillActive` are
    /// reported here. Everything after is observed through the returned handle.
    pub fn submit_clean(
        self: &Arc<Self>,
        rid: ReplicaId,
        base: &str,
        force: bool,
        certify_all: bool,
    ) -> Result<TaskHandle, OperationError> {
        if self.is_stopped() {
            return Err(OperationError::QueueDisconnected);
        }
        self.validate_target(rid)?;
        let ruv = self.ruv(base)?;
        let key = TaskKey::new(rid, base);
        self.expire_intents()?;

        let (generation, status) = self.tasks.admit_clean(&key, force, false)?;
        request_info!(%key, force, certify_all, "clean task admitted");
        status.set_phase(CleanPhase::Preparing);
        let handle = TaskHandle::new(status.clone());

        if self.tasks.has_intent(&key)? {
            // An abort arrived first, the clean never starts.
            self.tasks.finish_clean(&key, generation)?;
            status.log("An abort is pending for this replica id, not starting");
            status.finish(TaskExitCode::Aborted);
            return Ok(handle);
        }

        let prepared = {
            let rd = ruv.read();
            if force {
                Ok(rd.max_csn(rid))
            } else if !rd.contains_replica_id(rid) {
                Err(OperationError::NotFound)
            } else if !self.registry.agreements_to(rid).is_empty() {
                Err(OperationError::StillActive)
            } else {
                Ok(rd.max_csn(rid))
            }
        };

        let record = prepared.and_then(|origin_max| {
            let record = DbCleanTask {
                rid,
                base: base.to_string(),
                role: TaskRole::Origin,
                force,
                certify_all,
                origin: self.rid,
                phase: CleanPhase::Collecting,
                collected: BTreeSet::new(),
                laggards: BTreeSet::new(),
                purged: BTreeSet::new(),
                origin_max,
                last_error: None,
                created: duration_from_epoch_now(),
            };
            self.store.write_clean_task(&record)?;
            Ok(record)
        });

        let record = match record {
            Ok(record) => record,
            Err(e) => {
                request_warn!(?e, %key, "clean task failed in preparation");
                self.tasks.release_clean(&key, generation)?;
                status.finish(TaskExitCode::Failed(e.clone()));
                return Err(e);
            }
        };

        self.with_markers(|m| m.being_cleaned.insert(key.clone()))?;
        status.set_phase(CleanPhase::Collecting);
        self.spawn_clean(record, generation, status);
        Ok(handle)
    }

    /// Submit an abort of any clean of `rid` from `base`, whether or not one has
    /// reached this node yet.
    pub fn submit_abort(
        self: &Arc<Self>,
        rid: ReplicaId,
        base: &str,
        certify: bool,
    ) -> Result<TaskHandle, OperationError> {
        if self.is_stopped() {
            return Err(OperationError::QueueDisconnected);
        }
        self.validate_target(rid)?;
        self.ruv(base)?;
        let key = TaskKey::new(rid, base);
        self.expire_intents()?;

        let status = self.tasks.admit_abort(&key, BTreeSet::new(), false)?;
        let record = DbAbortTask {
            rid,
            base: base.to_string(),
            certify,
            phase: AbortPhase::Requested,
            acknowledged: BTreeSet::new(),
            created: duration_from_epoch_now(),
        };
        if let Err(e) = self.store.write_abort_task(&record) {
            self.release_abort(&key)?;
            status.finish(TaskExitCode::Failed(e.clone()));
            return Err(e);
        }

        request_info!(%key, certify, "abort task admitted");
        status.set_phase(AbortPhase::Requested);
        let handle = TaskHandle::new(status.clone());
        self.spawn_abort(record, status);
        Ok(handle)
    }

    fn spawn_clean(self: &Arc<Self>, record: DbCleanTask, generation: u64, status: Arc<TaskStatus>) {
        let task = CleanTask::new(self.clone(), record, generation, status);
        tokio::spawn(task.run());
    }

    fn spawn_abort(self: &Arc<Self>, record: DbAbortTask, status: Arc<TaskStatus>) {
        let task = AbortTask::new(self.clone(), record, status);
        tokio::spawn(task.run());
    }

    /// The clean task for `rid` and `base`, whether driven here or by another member.
    pub fn clean_task(&self, rid: ReplicaId, base: &str) -> Result<TaskHandle, OperationError> {
        self.tasks
            .clean_status(&TaskKey::new(rid, base))
            .map(|(_, status)| TaskHandle::new(status))
            .ok_or(OperationError::NoMatchingTask)
    }

    pub fn abort_task(&self, rid: ReplicaId, base: &str) -> Result<TaskHandle, OperationError> {
        self.tasks
            .abort_status(&TaskKey::new(rid, base))
            .map(TaskHandle::new)
            .ok_or(OperationError::NoMatchingTask)
    }

    /// Process a coordination message from `from`. Every message kind is idempotent.
    pub fn handle_message(
        &self,
        from: ReplicaId,
        msg: CoordinationMessage,
    ) -> Result<CoordinationResponse, SendError> {
        if self.is_stopped() {
            return Err(SendError::Unreachable);
        }
        request_trace!(%from, kind = msg.kind(), rid = %msg.rid(), base = %msg.base(), "coordination message");

        let res = match &msg {
            CoordinationMessage::ReplicaIdCleaningStarted {
                rid,
                base,
                force,
                origin,
            } => self.on_cleaning_started(*rid, base, *force, *origin),
            CoordinationMessage::ReplicaIdCleaned {
                rid,
                base,
                origin,
                purged_max,
            } => self.on_cleaned(from, *rid, base, *origin, *purged_max, &msg),
            CoordinationMessage::AbortCleaning {
                rid,
                base,
                certify,
                origin,
            } => self.on_abort_cleaning(from, *rid, base, *certify, *origin, &msg),
            CoordinationMessage::AbortAcknowledged {
                rid,
                base,
                from: acked_by,
            } => self
                .tasks
                .record_abort_ack(&TaskKey::new(*rid, base), *acked_by)
                .map(|_| CoordinationResponse::Ack),
        };

        res.map_err(|e| {
            request_error!(?e, %from, kind = msg.kind(), "unable to process coordination message");
            SendError::Rejected(e.to_string())
        })
    }

    fn on_cleaning_started(
        &self,
        rid: ReplicaId,
        base: &str,
        force: bool,
        origin: ReplicaId,
    ) -> Result<CoordinationResponse, OperationError> {
        let ruv = self.ruv(base)?;
        let key = TaskKey::new(rid, base);
        self.expire_intents()?;

        if self.tasks.has_intent(&key)? {
            return Ok(CoordinationResponse::Aborting);
        }
        if self.is_purged(&key)? {
            return Ok(CoordinationResponse::CleaningStarted { max_csn: None });
        }

        if self.tasks.admit_participant(&key, force, false)? {
            let record = DbCleanTask {
                rid,
                base: base.to_string(),
                role: TaskRole::Participant,
                force,
                certify_all: false,
                origin,
                phase: CleanPhase::Collecting,
                collected: BTreeSet::new(),
                laggards: BTreeSet::new(),
                purged: BTreeSet::new(),
                origin_max: None,
                last_error: None,
                created: duration_from_epoch_now(),
            };
            if let Err(e) = self.store.write_clean_task(&record) {
                self.tasks.drop_participant(&key, TaskExitCode::Failed(e.clone()))?;
                return Err(e);
            }
            self.with_markers(|m| m.being_cleaned.insert(key.clone()))?;
            request_info!(%key, %origin, "replica id marked as being cleaned");
        }

        Ok(CoordinationResponse::CleaningStarted {
            max_csn: ruv.read().max_csn(rid),
        })
    }

    fn on_cleaned(
        &self,
        from: ReplicaId,
        rid: ReplicaId,
        base: &str,
        origin: ReplicaId,
        purged_max: Option<Csn>,
        msg: &CoordinationMessage,
    ) -> Result<CoordinationResponse, OperationError> {
        let ruv = self.ruv(base)?;
        let key = TaskKey::new(rid, base);

        if self.is_purged(&key)? {
            // Already seen, do not relay again.
            return Ok(CoordinationResponse::Purged);
        }
        if self.tasks.has_intent(&key)? {
            return Ok(CoordinationResponse::Aborting);
        }

        let local_max = ruv.read().max_csn(rid);
        if local_max > purged_max {
            request_warn!(
                %key,
                local_max = ?local_max,
                purged_max = ?purged_max,
                "purging changes newer than the origin held"
            );
        }

        self.purge_replica_id(base, rid)?;
        if self.tasks.drop_participant(&key, TaskExitCode::Success)? {
            self.store.delete_clean_task(&key)?;
        }

        self.relay(msg, &[from, origin, rid])?;
        Ok(CoordinationResponse::Purged)
    }

    fn on_abort_cleaning(
        &self,
        from: ReplicaId,
        rid: ReplicaId,
        base: &str,
        certify: bool,
        origin: ReplicaId,
        msg: &CoordinationMessage,
    ) -> Result<CoordinationResponse, OperationError> {
        self.ruv(base)?;
        let key = TaskKey::new(rid, base);

        let fresh = self.record_abort_intent(DbAbortIntent {
            rid,
            base: base.to_string(),
            certify,
            origin,
            created: duration_from_epoch_now(),
            released: None,
        })?;

        if fresh {
            self.abandon_participant(&key)?;
            self.relay(msg, &[from, origin, rid])?;
        }

        if certify && origin != self.rid {
            self.channel.enqueue_durable(
                origin,
                CoordinationMessage::AbortAcknowledged {
                    rid,
                    base: base.to_string(),
                    from: self.rid,
                },
            )?;
        }
        Ok(CoordinationResponse::Ack)
    }
}
