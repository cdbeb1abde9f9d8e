//! The state machine that drives one abort from the member it was submitted to.
//!
//! An abort can not itself be cancelled. Without certify it completes as soon as the
//! abort has been queued to every reachable member. With certify it waits, across any
//! number of restarts, until every member has acknowledged abandoning the clean.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::be::{DbAbortIntent, DbAbortTask};
use crate::prelude::*;
use crate::repl::status::TaskStatus;
use crate::repl::{CoreAction, Interrupt};
use crate::utils::Backoff;

pub(crate) struct AbortTask {
    node: Arc<ReplicaNode>,
    key: TaskKey,
    record: DbAbortTask,
    status: Arc<TaskStatus>,
    backoff: Backoff,
    // Members the abort has been queued to by this run.
    sent: BTreeSet<ReplicaId>,
    shutdown_rx: broadcast::Receiver<CoreAction>,
    signal_rx: watch::Receiver<u64>,
}

impl AbortTask {
    pub(crate) fn new(node: Arc<ReplicaNode>, record: DbAbortTask, status: Arc<TaskStatus>) -> Self {
        let backoff = Backoff::new(node.config.backoff_initial(), node.config.backoff_max());
        let shutdown_rx = node.subscribe_shutdown();
        let signal_rx = node.tasks.subscribe();
        AbortTask {
            key: record.key(),
            node,
            record,
            status,
            backoff,
            sent: BTreeSet::new(),
            shutdown_rx,
            signal_rx,
        }
    }

    #[instrument(level = "debug", name = "abort_task", skip_all, fields(key = %self.key))]
    pub(crate) async fn run(mut self) {
        let res = self.drive().await;
        self.conclude(res);
    }

    async fn drive(&mut self) -> Result<(), Interrupt> {
        loop {
            match self.record.phase {
                AbortPhase::Requested => self.request()?,
                AbortPhase::Propagating => self.propagate().await?,
                AbortPhase::Confirmed => return Ok(()),
            }
        }
    }

    fn check(&self) -> Result<(), Interrupt> {
        if self.node.is_stopped() {
            Err(Interrupt::Shutdown)
        } else {
            Ok(())
        }
    }

    fn advance(&mut self, phase: AbortPhase) -> Result<(), Interrupt> {
        self.check()?;
        self.record.phase = phase;
        self.node.store.write_abort_task(&self.record)?;
        task_info!(key = %self.key, %phase, "abort task phase change");
        self.status.set_phase(phase);
        self.backoff.reset();
        Ok(())
    }

    fn request(&mut self) -> Result<(), Interrupt> {
        self.check()?;
        let fresh = self.node.record_abort_intent(DbAbortIntent {
            rid: self.record.rid,
            base: self.record.base.clone(),
            certify: self.record.certify,
            origin: self.node.rid(),
            created: duration_from_epoch_now(),
            released: None,
        })?;
        if !fresh {
            self.status.log("An abort intent was already held for this replica id");
        }
        self.node.abandon_participant(&self.key)?;
        self.advance(AbortPhase::Propagating)
    }

    fn send_to(&mut self, targets: &BTreeSet<ReplicaId>) -> Result<(), Interrupt> {
        let msg = CoordinationMessage::AbortCleaning {
            rid: self.record.rid,
            base: self.record.base.clone(),
            certify: self.record.certify,
            origin: self.node.rid(),
        };
        let unsent: Vec<ReplicaId> = targets.difference(&self.sent).copied().collect();
        for target in unsent {
            self.node.channel.enqueue_durable(target, msg.clone())?;
            self.sent.insert(target);
        }
        Ok(())
    }

    async fn propagate(&mut self) -> Result<(), Interrupt> {
        let targets = self
            .node
            .registry
            .read()
            .reachable_from(self.node.rid(), self.record.rid);
        self.send_to(&targets)?;
        self.status.log(format!("Abort queued to {} members", targets.len()));

        if !self.record.certify {
            return self.advance(AbortPhase::Confirmed);
        }

        loop {
            self.check()?;
            let required = self.node.abort_required(self.record.rid);
            let acks = self.node.tasks.abort_acks(&self.key)?;
            if acks != self.record.acknowledged {
                self.record.acknowledged = acks;
                self.node.store.write_abort_task(&self.record)?;
            }

            let pending: BTreeSet<ReplicaId> = required
                .difference(&self.record.acknowledged)
                .copied()
                .collect();
            self.status
                .set_progress(required.len() - pending.len(), required.len());
            if pending.is_empty() {
                break;
            }

            for member in pending.iter() {
                match self.node.channel.blocked_on(*member) {
                    Some(reason) => self
                        .status
                        .record_send_error(*member, &SendError::Rejected(reason)),
                    None => self.status.record_send_ok(*member),
                }
            }
            task_trace!(key = %self.key, pending = ?pending, "waiting for abort acknowledgements");
            self.status.set_status(format!(
                "Waiting for {} members to acknowledge the abort",
                pending.len()
            ));
            // Members that joined since the abort started have not been sent it yet.
            self.send_to(&pending)?;

            let delay = self.backoff.next_delay();
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => return Err(Interrupt::Shutdown),
                _ = self.signal_rx.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.advance(AbortPhase::Confirmed)
    }

    fn conclude(self, res: Result<(), Interrupt>) {
        let res = match res {
            Ok(()) => self
                .node
                .release_abort(&self.key)
                .and_then(|_| self.node.store.delete_abort_task(&self.key)),
            Err(Interrupt::Shutdown) => {
                task_info!(key = %self.key, phase = %self.record.phase, "abort task interrupted by shutdown, will resume on start");
                return;
            }
            Err(Interrupt::Failed(e)) => Err(e),
            Err(Interrupt::Abort) | Err(Interrupt::Superseded) => Err(OperationError::InvalidState),
        };

        match res {
            Ok(()) => {
                admin_info!(key = %self.key, certify = self.record.certify, "abort task complete");
                self.status.finish(TaskExitCode::Success);
            }
            Err(e) => {
                admin_error!(?e, key = %self.key, phase = %self.record.phase, "abort task failed");
                if let Err(e) = self.node.release_abort(&self.key) {
                    task_error!(?e, key = %self.key, "unable to release failed abort task");
                }
                self.status.finish(TaskExitCode::Failed(e));
            }
        }
    }
}
