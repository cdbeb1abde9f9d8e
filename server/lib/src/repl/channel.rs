//! Delivery of coordination messages to other members.
//!
//! Each target has its own courier task fed by a queue, so messages to the same target
//! are delivered in the order they were sent. There is no ordering between targets.
//!
//! Two delivery modes share the queue. A request waits for the target's reply and is
//! given up after the send timeout. A durable message is written to the outbox first,
//! then retried on the backoff schedule until the target accepts it, surviving a
//! restart of this server.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::be::DbOutboxEntry;
use crate::prelude::*;
use crate::repl::status::REJECTIONS_BEFORE_STALLED;
use crate::repl::CoreAction;
use crate::utils::Backoff;

/// The replication transport supplied by the embedding server.
#[async_trait]
pub trait ReplTransport: Send + Sync {
    async fn deliver(
        &self,
        from: ReplicaId,
        to: ReplicaId,
        msg: CoordinationMessage,
    ) -> Result<CoordinationResponse, SendError>;
}

type Reply = Result<CoordinationResponse, SendError>;

// Targets whose durable queue head is being refused, with the latest reason.
type BlockedTargets = Arc<Mutex<BTreeMap<ReplicaId, String>>>;

enum Outgoing {
    Request {
        msg: CoordinationMessage,
        reply: oneshot::Sender<Reply>,
    },
    Durable {
        seq: u64,
        msg: CoordinationMessage,
    },
}

#[derive(Clone)]
struct Courier {
    from: ReplicaId,
    target: ReplicaId,
    transport: Arc<dyn ReplTransport>,
    registry: Arc<ReplicaRegistry>,
    store: Arc<dyn ReplStateStore>,
    blocked: BlockedTargets,
    send_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl Courier {
    fn set_blocked(&self, reason: Option<String>) {
        if let Ok(mut blocked) = self.blocked.lock() {
            match reason {
                Some(reason) => {
                    blocked.insert(self.target, reason);
                }
                None => {
                    blocked.remove(&self.target);
                }
            }
        }
    }

    async fn deliver_once(&self, msg: &CoordinationMessage) -> Reply {
        let fut = self.transport.deliver(self.from, self.target, msg.clone());
        let res = match tokio::time::timeout(self.send_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(SendError::Timeout),
        };

        match &res {
            // A rejection still proves the member is up.
            Ok(_) | Err(SendError::Rejected(_)) => self.registry.set_reachable(self.target, true),
            Err(_) => self.registry.set_reachable(self.target, false),
        }
        res
    }

    /// Returns false if the courier must stop.
    async fn deliver_durable(
        &self,
        seq: u64,
        msg: &CoordinationMessage,
        shutdown: &mut broadcast::Receiver<CoreAction>,
    ) -> bool {
        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);
        let mut rejections: u32 = 0;
        loop {
            match self.deliver_once(msg).await {
                Ok(_) => {
                    if rejections > 0 {
                        self.set_blocked(None);
                    }
                    if let Err(e) = self.store.delete_outbox(seq) {
                        admin_error!(?e, seq, "unable to remove delivered message from outbox");
                    }
                    return true;
                }
                Err(SendError::Rejected(reason)) => {
                    rejections += 1;
                    if rejections == REJECTIONS_BEFORE_STALLED {
                        admin_warn!(
                            target = %self.target,
                            kind = msg.kind(),
                            seq,
                            %reason,
                            "member keeps rejecting a durable message, later messages to it are held back"
                        );
                    } else {
                        request_warn!(target = %self.target, kind = msg.kind(), seq, rejections, %reason, "durable message rejected, will retry");
                    }
                    self.set_blocked(Some(reason));
                }
                Err(e) => {
                    request_trace!(?e, target = %self.target, kind = msg.kind(), seq, "durable delivery failed, will retry");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.recv() => return false,
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<Outgoing>,
        mut shutdown: broadcast::Receiver<CoreAction>,
    ) {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            match item {
                Outgoing::Request { msg, reply } => {
                    if reply.is_closed() {
                        // The sender already gave up on this one.
                        continue;
                    }
                    let res = self.deliver_once(&msg).await;
                    let _ = reply.send(res);
                }
                Outgoing::Durable { seq, msg } => {
                    if !self.deliver_durable(seq, &msg, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        request_trace!(target = %self.target, "courier stopped");
    }
}

pub struct PropagationChannel {
    rid: ReplicaId,
    transport: Arc<dyn ReplTransport>,
    registry: Arc<ReplicaRegistry>,
    store: Arc<dyn ReplStateStore>,
    blocked: BlockedTargets,
    send_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    couriers: Mutex<BTreeMap<ReplicaId, mpsc::UnboundedSender<Outgoing>>>,
    next_seq: AtomicU64,
    shutdown: broadcast::Sender<CoreAction>,
    stopped: AtomicBool,
}

impl PropagationChannel {
    pub fn new(
        rid: ReplicaId,
        config: &CleanAllRuvConfig,
        transport: Arc<dyn ReplTransport>,
        registry: Arc<ReplicaRegistry>,
        store: Arc<dyn ReplStateStore>,
        shutdown: broadcast::Sender<CoreAction>,
    ) -> Result<Self, OperationError> {
        let next_seq = store
            .list_outbox()?
            .iter()
            .map(|e| e.seq)
            .max()
            .map(|s| s + 1)
            .unwrap_or(1);

        Ok(PropagationChannel {
            rid,
            transport,
            registry,
            store,
            blocked: Arc::new(Mutex::new(BTreeMap::new())),
            send_timeout: config.send_timeout(),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
            couriers: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(next_seq),
            shutdown,
            stopped: AtomicBool::new(false),
        })
    }

    fn courier(&self, target: ReplicaId) -> Courier {
        Courier {
            from: self.rid,
            target,
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            blocked: self.blocked.clone(),
            send_timeout: self.send_timeout,
            backoff_initial: self.backoff_initial,
            backoff_max: self.backoff_max,
        }
    }

    fn enqueue(&self, target: ReplicaId, item: Outgoing) -> Result<(), SendError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SendError::Unreachable);
        }

        let mut couriers = self.couriers.lock().map_err(|_| {
            admin_error!("propagation channel mutex poisoned");
            SendError::Unreachable
        })?;

        let item = match couriers.get(&target) {
            Some(tx) => match tx.send(item) {
                Ok(()) => return Ok(()),
                // The courier went away, start a new one below.
                Err(e) => e.0,
            },
            None => item,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.courier(target).run(rx, self.shutdown.subscribe()));
        tx.send(item).map_err(|_| SendError::Unreachable)?;
        couriers.insert(target, tx);
        Ok(())
    }

    /// Send `msg` to `target` and wait for its reply.
    pub async fn send(&self, target: ReplicaId, msg: CoordinationMessage) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.enqueue(target, Outgoing::Request { msg, reply: tx })?;
        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(res)) => res,
            // The courier stopped before replying.
            Ok(Err(_)) => Err(SendError::Unreachable),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Send `msg` to each of `targets` concurrently, collecting every reply.
    pub async fn broadcast(
        &self,
        targets: &BTreeSet<ReplicaId>,
        msg: &CoordinationMessage,
    ) -> Vec<(ReplicaId, Reply)> {
        let sends = targets.iter().map(|target| async move {
            let res = self.send(*target, msg.clone()).await;
            (*target, res)
        });
        join_all(sends).await
    }

    /// Queue `msg` for delivery to `target` until it is accepted. The message is in the
    /// outbox when this returns, so it is delivered even if this server restarts first.
    pub fn enqueue_durable(
        &self,
        target: ReplicaId,
        msg: CoordinationMessage,
    ) -> Result<(), OperationError> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.store.write_outbox(&DbOutboxEntry {
            seq,
            target,
            msg: msg.clone(),
        })?;
        request_trace!(%target, kind = msg.kind(), seq, "queued durable message");
        if let Err(e) = self.enqueue(target, Outgoing::Durable { seq, msg }) {
            request_warn!(?e, %target, seq, "durable message left in outbox for the next start");
        }
        Ok(())
    }

    /// Queue every message left in the outbox by a previous run.
    pub fn restore_outbox(&self) -> Result<usize, OperationError> {
        let pending = self.store.list_outbox()?;
        let count = pending.len();
        for entry in pending {
            if let Err(e) = self.enqueue(
                entry.target,
                Outgoing::Durable {
                    seq: entry.seq,
                    msg: entry.msg,
                },
            ) {
                request_warn!(?e, seq = entry.seq, "unable to restore outbox message");
            }
        }
        Ok(count)
    }

    /// The reason `target` gave for refusing the durable message at the head of its
    /// queue, while it keeps refusing it.
    pub fn blocked_on(&self, target: ReplicaId) -> Option<String> {
        self.blocked
            .lock()
            .ok()
            .and_then(|blocked| blocked.get(&target).cloned())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Ok(mut couriers) = self.couriers.lock() {
            couriers.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PropagationChannel, ReplTransport};
    use crate::be::MemoryStateStore;
    use crate::prelude::*;
    use crate::repl::CoreAction;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    const BASE: &str = "dc=example,dc=com";

    #[derive(Default)]
    struct RecordingTransport {
        up: AtomicBool,
        reject: AtomicBool,
        seen: Mutex<Vec<(ReplicaId, CoordinationMessage)>>,
    }

    #[async_trait]
    impl ReplTransport for RecordingTransport {
        async fn deliver(
            &self,
            _from: ReplicaId,
            to: ReplicaId,
            msg: CoordinationMessage,
        ) -> Result<CoordinationResponse, SendError> {
            if !self.up.load(Ordering::Acquire) {
                return Err(SendError::Unreachable);
            }
            if self.reject.load(Ordering::Acquire) {
                return Err(SendError::Rejected("CapacityExceeded".to_string()));
            }
            self.seen.lock().expect("lock").push((to, msg));
            Ok(CoordinationResponse::Ack)
        }
    }

    fn ack(rid: u16, from: u16) -> CoordinationMessage {
        CoordinationMessage::AbortAcknowledged {
            rid: ReplicaId(rid),
            base: BASE.to_string(),
            from: ReplicaId(from),
        }
    }

    fn open_channel(
        transport: Arc<RecordingTransport>,
        store: Arc<MemoryStateStore>,
        registry: Arc<ReplicaRegistry>,
    ) -> (PropagationChannel, broadcast::Sender<CoreAction>) {
        let (shutdown, _) = broadcast::channel(4);
        let channel = PropagationChannel::new(
            ReplicaId(1),
            &CleanAllRuvConfig::new_for_test(),
            transport,
            registry,
            store,
            shutdown.clone(),
        )
        .expect("channel");
        (channel, shutdown)
    }

    async fn wait_for_empty_outbox(store: &MemoryStateStore) {
        for _ in 0..200 {
            if store.list_outbox().expect("outbox").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            store.list_outbox().expect("outbox").is_empty(),
            "outbox was never drained"
        );
    }

    #[tokio::test]
    async fn test_durable_messages_are_fifo_and_retried() {
        sketching::test_init();
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryStateStore::default());
        let registry = Arc::new(ReplicaRegistry::default());
        let (channel, _shutdown) = open_channel(transport.clone(), store.clone(), registry.clone());

        // Target is down, messages wait in the outbox.
        for from in 2..=4 {
            channel
                .enqueue_durable(ReplicaId(2), ack(9, from))
                .expect("enqueue");
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.list_outbox().expect("outbox").len(), 3);
        assert!(!registry.is_reachable(ReplicaId(2)));

        transport.up.store(true, Ordering::Release);
        wait_for_empty_outbox(&store).await;

        let seen: Vec<CoordinationMessage> = transport
            .seen
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, m)| m.clone())
            .collect();
        assert_eq!(seen, vec![ack(9, 2), ack(9, 3), ack(9, 4)]);
        assert!(registry.is_reachable(ReplicaId(2)));
    }

    #[tokio::test]
    async fn test_refused_durable_message_is_reported_until_accepted() {
        sketching::test_init();
        let transport = Arc::new(RecordingTransport::default());
        transport.up.store(true, Ordering::Release);
        transport.reject.store(true, Ordering::Release);
        let store = Arc::new(MemoryStateStore::default());
        let registry = Arc::new(ReplicaRegistry::default());
        let (channel, _shutdown) = open_channel(transport.clone(), store.clone(), registry.clone());

        channel
            .enqueue_durable(ReplicaId(2), ack(9, 3))
            .expect("enqueue");
        for _ in 0..200 {
            if channel.blocked_on(ReplicaId(2)).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            channel.blocked_on(ReplicaId(2)).as_deref(),
            Some("CapacityExceeded")
        );
        assert_eq!(channel.blocked_on(ReplicaId(3)), None);
        // A refusal still proves the member is up.
        assert!(registry.is_reachable(ReplicaId(2)));
        assert_eq!(store.list_outbox().expect("outbox").len(), 1);

        transport.reject.store(false, Ordering::Release);
        wait_for_empty_outbox(&store).await;
        assert_eq!(channel.blocked_on(ReplicaId(2)), None);
    }

    #[tokio::test]
    async fn test_outbox_survives_restart() {
        sketching::test_init();
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryStateStore::default());
        let registry = Arc::new(ReplicaRegistry::default());

        {
            let (channel, shutdown) = open_channel(transport.clone(), store.clone(), registry.clone());
            channel
                .enqueue_durable(ReplicaId(3), ack(9, 1))
                .expect("enqueue");
            let _ = shutdown.send(CoreAction::Shutdown);
            channel.stop();
            assert_eq!(
                channel.send(ReplicaId(3), ack(9, 1)).await,
                Err(SendError::Unreachable)
            );
        }

        transport.up.store(true, Ordering::Release);
        let (channel, _shutdown) = open_channel(transport.clone(), store.clone(), registry);
        assert_eq!(channel.restore_outbox(), Ok(1));
        wait_for_empty_outbox(&store).await;

        let replies = channel
            .broadcast(&BTreeSet::from([ReplicaId(2), ReplicaId(3)]), &ack(9, 1))
            .await;
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(_, r)| r == &Ok(CoordinationResponse::Ack)));
    }
}
