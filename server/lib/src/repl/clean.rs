//! The state machine that drives one clean from the member it was submitted to.
//!
//! Every phase boundary is persisted before the phase is entered, so a restarted node
//! resumes the instance where it stopped. Each pass of a phase first checks whether
//! the instance was superseded or aborted, and that check is repeated immediately
//! before the record is written.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::be::{DbAbortIntent, DbCleanTask};
use crate::prelude::*;
use crate::repl::status::TaskStatus;
use crate::repl::tasks::CleanOutcome;
use crate::repl::{CoreAction, Interrupt};
use crate::utils::Backoff;

pub(crate) struct CleanTask {
    node: Arc<ReplicaNode>,
    key: TaskKey,
    record: DbCleanTask,
    generation: u64,
    status: Arc<TaskStatus>,
    backoff: Backoff,
    // The newest change of the replica id each member reported.
    reported: BTreeMap<ReplicaId, Option<Csn>>,
    shutdown_rx: broadcast::Receiver<CoreAction>,
    signal_rx: watch::Receiver<u64>,
}

impl CleanTask {
    pub(crate) fn new(
        node: Arc<ReplicaNode>,
        record: DbCleanTask,
        generation: u64,
        status: Arc<TaskStatus>,
    ) -> Self {
        let backoff = Backoff::new(node.config.backoff_initial(), node.config.backoff_max());
        let shutdown_rx = node.subscribe_shutdown();
        let signal_rx = node.tasks.subscribe();
        CleanTask {
            key: record.key(),
            node,
            record,
            generation,
            status,
            backoff,
            reported: BTreeMap::new(),
            shutdown_rx,
            signal_rx,
        }
    }

    #[instrument(level = "debug", name = "clean_task", skip_all, fields(key = %self.key))]
    pub(crate) async fn run(mut self) {
        let res = self.drive().await;
        self.conclude(res);
    }

    async fn drive(&mut self) -> Result<(), Interrupt> {
        loop {
            match self.record.phase {
                CleanPhase::Preparing | CleanPhase::Collecting => self.collect().await?,
                CleanPhase::Releasing => self.release().await?,
                CleanPhase::Cleaning => return self.clean().await,
                CleanPhase::Done | CleanPhase::Aborted => return Ok(()),
            }
        }
    }

    fn check(&self) -> Result<(), Interrupt> {
        if self.node.is_stopped() {
            return Err(Interrupt::Shutdown);
        }
        match self.node.tasks.check_clean(&self.key, self.generation)? {
            Some(CleanOutcome::Aborted) => Err(Interrupt::Abort),
            Some(CleanOutcome::Superseded) => Err(Interrupt::Superseded),
            Some(CleanOutcome::Done) | None => Ok(()),
        }
    }

    fn persist(&self) -> Result<(), Interrupt> {
        self.check()?;
        self.node.store.write_clean_task(&self.record)?;
        Ok(())
    }

    fn advance(&mut self, phase: CleanPhase) -> Result<(), Interrupt> {
        self.record.phase = phase;
        self.persist()?;
        task_info!(key = %self.key, %phase, "clean task phase change");
        self.status.set_phase(phase);
        self.backoff.reset();
        Ok(())
    }

    /// Wait for the next retry, waking early if the registry signals a change.
    async fn pause(&mut self) -> Result<(), Interrupt> {
        let delay = self.backoff.next_delay();
        tokio::select! {
            biased;
            _ = self.shutdown_rx.recv() => return Err(Interrupt::Shutdown),
            _ = self.signal_rx.changed() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        self.check()
    }

    fn started_msg(&self) -> CoordinationMessage {
        CoordinationMessage::ReplicaIdCleaningStarted {
            rid: self.record.rid,
            base: self.record.base.clone(),
            force: self.record.force,
            origin: self.node.rid(),
        }
    }

    /// A member answered that it holds an abort intent. Record it here so that this
    /// instance concludes as aborted.
    fn abort_seen(&self, from: ReplicaId) -> Interrupt {
        task_warn!(key = %self.key, %from, "member reports this clean is being aborted");
        let intent = DbAbortIntent {
            rid: self.record.rid,
            base: self.record.base.clone(),
            certify: false,
            origin: from,
            created: duration_from_epoch_now(),
            released: None,
        };
        match self.node.record_abort_intent(intent) {
            Ok(_) => Interrupt::Abort,
            Err(e) => Interrupt::Failed(e),
        }
    }

    /// Record a failed request on the status and the record. Returns true if the
    /// record changed.
    fn note_send_error(&mut self, target: ReplicaId, err: SendError) -> bool {
        // A request queued behind a durable message the member keeps refusing times
        // out. Report the refusal.
        let err = match (err, self.node.channel.blocked_on(target)) {
            (SendError::Timeout, Some(reason)) => SendError::Rejected(reason),
            (err, _) => err,
        };
        task_warn!(key = %self.key, %target, ?err, phase = %self.record.phase, "member did not accept request");
        self.status.record_send_error(target, &err);

        let text = format!("member {target}: {err}");
        if self.record.last_error.as_deref() == Some(text.as_str()) {
            false
        } else {
            self.record.last_error = Some(text);
            true
        }
    }

    /// Tell every member this run may have marked that the clean is abandoned, so
    /// that each releases its participant entry.
    fn withdraw(&self) -> Result<(), OperationError> {
        let me = self.node.rid();
        let mut targets = self
            .node
            .registry
            .read()
            .reachable_from(me, self.record.rid);
        targets.extend(self.record.collected.iter().copied());
        targets.extend(self.record.laggards.iter().copied());
        targets.remove(&me);
        targets.remove(&self.record.rid);

        let msg = CoordinationMessage::AbortCleaning {
            rid: self.record.rid,
            base: self.record.base.clone(),
            certify: false,
            origin: me,
        };
        for target in targets.iter() {
            self.node.channel.enqueue_durable(*target, msg.clone())?;
        }
        self.status
            .log(format!("Abort queued to {} members", targets.len()));
        Ok(())
    }

    async fn collect(&mut self) -> Result<(), Interrupt> {
        let me = self.node.rid();
        let msg = self.started_msg();

        loop {
            self.check()?;
            let targets = self.node.registry.read().reachable_from(me, self.record.rid);
            let pending: BTreeSet<ReplicaId> =
                targets.difference(&self.record.collected).copied().collect();

            let mut changed = false;
            let replies = self.node.channel.broadcast(&pending, &msg).await;
            for (target, reply) in replies {
                if reply.is_ok() {
                    self.status.record_send_ok(target);
                }
                match reply {
                    Ok(CoordinationResponse::CleaningStarted { max_csn }) => {
                        self.record.collected.insert(target);
                        self.reported.insert(target, max_csn);
                        self.status
                            .log(format!("Member {target} has marked the replica id as being cleaned"));
                        changed = true;
                    }
                    Ok(CoordinationResponse::Aborting) => return Err(self.abort_seen(target)),
                    Ok(other) => {
                        task_warn!(key = %self.key, %target, ?other, "unexpected reply while collecting");
                    }
                    Err(e) => changed |= self.note_send_error(target, e),
                }
            }

            let responded = targets.intersection(&self.record.collected).count();
            self.status.set_progress(responded, targets.len());
            if changed {
                self.persist()?;
            }

            if responded == targets.len() {
                break;
            }

            if self.record.force {
                let quorum = self.node.config.force_quorum(targets.len());
                if responded >= quorum {
                    self.record.laggards = targets
                        .difference(&self.record.collected)
                        .copied()
                        .collect();
                    task_warn!(
                        key = %self.key,
                        responded,
                        quorum,
                        laggards = ?self.record.laggards,
                        "force clean proceeding without every member"
                    );
                    self.status.log(format!(
                        "Proceeding with {} of {} members, the rest will be cleaned in the background",
                        responded,
                        targets.len()
                    ));
                    self.persist()?;
                    for laggard in self.record.laggards.iter() {
                        self.node.channel.enqueue_durable(*laggard, msg.clone())?;
                    }
                    break;
                }
            }

            self.status.set_status(format!(
                "Waiting for {} members to respond",
                targets.len() - responded
            ));
            self.pause().await?;
        }

        self.advance(CleanPhase::Releasing)
    }

    async fn release(&mut self) -> Result<(), Interrupt> {
        let rid = self.record.rid;
        let base = self.record.base.clone();

        if self.record.force {
            task_info!(key = %self.key, "force clean does not wait for members to catch up");
            self.status
                .log("Not waiting for members to catch up with the replica id, force is set");
        } else {
            self.await_caught_up().await?;
        }

        self.check()?;
        let local_max = self
            .node
            .ruv_range(&base)?
            .get(&rid)
            .map(|range| range.csn_max);
        if local_max > self.record.origin_max {
            self.record.origin_max = local_max;
        }
        self.node.purge_replica_id(&base, rid)?;
        self.status.log("Purged the replica id from the local update vector");

        self.advance(CleanPhase::Cleaning)
    }

    /// Poll members until each has applied the newest change of the replica id that
    /// this member holds.
    async fn await_caught_up(&mut self) -> Result<(), Interrupt> {
        let me = self.node.rid();
        let msg = self.started_msg();

        loop {
            self.check()?;
            let members = self.node.registry.members();
            let mut required: BTreeSet<ReplicaId> = self
                .record
                .collected
                .intersection(&members)
                .copied()
                .collect();
            if self.record.certify_all {
                required.extend(members.iter().copied());
            }
            required.remove(&me);
            required.remove(&self.record.rid);

            let origin_max = self.record.origin_max;
            let lagging: BTreeSet<ReplicaId> = required
                .iter()
                .filter(|m| {
                    origin_max.is_some()
                        && self.reported.get(*m).copied().flatten() < origin_max
                })
                .copied()
                .collect();

            self.status
                .set_progress(required.len() - lagging.len(), required.len());
            if lagging.is_empty() {
                return Ok(());
            }

            task_trace!(key = %self.key, lagging = ?lagging, "waiting for members to catch up");
            self.status.set_status(format!(
                "Waiting for {} members to catch up with {}",
                lagging.len(),
                origin_max.map(|c| c.to_string()).unwrap_or_default()
            ));

            let mut changed = false;
            let replies = self.node.channel.broadcast(&lagging, &msg).await;
            for (target, reply) in replies {
                if reply.is_ok() {
                    self.status.record_send_ok(target);
                }
                match reply {
                    Ok(CoordinationResponse::CleaningStarted { max_csn }) => {
                        self.reported.insert(target, max_csn);
                        // Under certify all this may be a member collecting never
                        // reached. It is marked now, so it must be told of the purge.
                        changed |= self.record.collected.insert(target);
                    }
                    Ok(CoordinationResponse::Aborting) => return Err(self.abort_seen(target)),
                    Ok(other) => {
                        task_warn!(key = %self.key, %target, ?other, "unexpected reply while releasing");
                    }
                    Err(e) => changed |= self.note_send_error(target, e),
                }
            }

            if changed {
                self.persist()?;
            }

            let still_lagging = lagging
                .iter()
                .filter(|m| self.reported.get(*m).copied().flatten() < origin_max)
                .count();
            if still_lagging > 0 {
                self.pause().await?;
            }
        }
    }

    async fn clean(&mut self) -> Result<(), Interrupt> {
        let me = self.node.rid();
        let msg = CoordinationMessage::ReplicaIdCleaned {
            rid: self.record.rid,
            base: self.record.base.clone(),
            origin: me,
            purged_max: self.record.origin_max,
        };

        // Laggards of a force clean converge through the outbox. Their earlier
        // cleaning started message is ahead of this one in the same queue.
        for laggard in self.record.laggards.iter() {
            self.node.channel.enqueue_durable(*laggard, msg.clone())?;
        }

        loop {
            self.check()?;
            let members = self.node.registry.members();
            let pending: BTreeSet<ReplicaId> = self
                .record
                .collected
                .iter()
                .filter(|m| {
                    **m != me && members.contains(*m) && !self.record.purged.contains(*m)
                })
                .copied()
                .collect();

            let total = pending.len() + self.record.purged.len();
            self.status.set_progress(self.record.purged.len(), total);
            if pending.is_empty() {
                return Ok(());
            }
            self.status
                .set_status(format!("Waiting for {} members to purge", pending.len()));

            let mut changed = false;
            let mut progressed = false;
            let replies = self.node.channel.broadcast(&pending, &msg).await;
            for (target, reply) in replies {
                if reply.is_ok() {
                    self.status.record_send_ok(target);
                }
                match reply {
                    Ok(CoordinationResponse::Purged) => {
                        self.record.purged.insert(target);
                        self.status
                            .log(format!("Member {target} has purged the replica id"));
                        progressed = true;
                    }
                    Ok(CoordinationResponse::Aborting) => return Err(self.abort_seen(target)),
                    Ok(other) => {
                        task_warn!(key = %self.key, %target, ?other, "unexpected reply while cleaning");
                    }
                    Err(e) => changed |= self.note_send_error(target, e),
                }
            }

            if changed || progressed {
                self.persist()?;
            }
            if !progressed {
                self.pause().await?;
            }
        }
    }

    fn conclude(self, res: Result<(), Interrupt>) {
        let outcome = match res {
            Ok(()) | Err(Interrupt::Abort) => {
                self.node.tasks.finish_clean(&self.key, self.generation)
            }
            Err(Interrupt::Superseded) => Ok(CleanOutcome::Superseded),
            Err(Interrupt::Shutdown) => {
                task_info!(key = %self.key, phase = %self.record.phase, "clean task interrupted by shutdown, will resume on start");
                return;
            }
            Err(Interrupt::Failed(e)) => Err(e),
        };

        let res = outcome.and_then(|outcome| {
            match outcome {
                CleanOutcome::Done => {
                    self.node.store.delete_clean_task(&self.key)?;
                    self.status.set_phase(CleanPhase::Done);
                    admin_info!(key = %self.key, "replica id cleaned from all members");
                    self.status.finish(TaskExitCode::Success);
                }
                CleanOutcome::Aborted => {
                    self.node.store.delete_clean_task(&self.key)?;
                    self.node.clear_being_cleaned(&self.key)?;
                    self.withdraw()?;
                    self.status.set_phase(CleanPhase::Aborted);
                    admin_warn!(key = %self.key, phase = %self.record.phase, "clean task aborted");
                    self.status.finish(TaskExitCode::Aborted);
                }
                CleanOutcome::Superseded => {
                    // The record now belongs to the instance that took over.
                    admin_info!(key = %self.key, "clean task superseded by a force clean");
                    self.status.finish(TaskExitCode::Superseded);
                }
            }
            Ok(())
        });

        if let Err(e) = res {
            admin_error!(?e, key = %self.key, phase = %self.record.phase, "clean task failed");
            if let Err(e) = self.node.tasks.release_clean(&self.key, self.generation) {
                task_error!(?e, key = %self.key, "unable to release failed clean task");
            }
            self.status.finish(TaskExitCode::Failed(e));
        }
    }
}
