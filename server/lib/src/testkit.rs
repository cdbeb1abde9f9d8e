//! In process topologies for tests. Every member is a real [`ReplicaNode`] with its own
//! memory store, and messages are delivered by calling the target node directly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::be::MemoryStateStore;
use crate::prelude::*;
use crate::repl::channel::ReplTransport;

pub const TEST_BASE: &str = "dc=example,dc=com";

/// Delivers to whichever nodes are currently attached. A detached node is unreachable,
/// as is any node over a blocked link.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<BTreeMap<ReplicaId, Arc<ReplicaNode>>>,
    blocked_links: RwLock<BTreeSet<(ReplicaId, ReplicaId)>>,
}

impl LocalTransport {
    pub fn attach(&self, node: Arc<ReplicaNode>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.rid(), node);
        }
    }

    pub fn detach(&self, rid: ReplicaId) -> Option<Arc<ReplicaNode>> {
        self.nodes.write().ok().and_then(|mut nodes| nodes.remove(&rid))
    }

    /// Drop every message sent from `from` to `to`. The reverse direction is unaffected.
    pub fn block_link(&self, from: ReplicaId, to: ReplicaId) {
        if let Ok(mut links) = self.blocked_links.write() {
            links.insert((from, to));
        }
    }

    fn is_blocked(&self, from: ReplicaId, to: ReplicaId) -> bool {
        self.blocked_links
            .read()
            .map(|links| links.contains(&(from, to)))
            .unwrap_or(false)
    }

    fn get(&self, rid: ReplicaId) -> Option<Arc<ReplicaNode>> {
        self.nodes.read().ok().and_then(|nodes| nodes.get(&rid).cloned())
    }
}

#[async_trait]
impl ReplTransport for LocalTransport {
    async fn deliver(
        &self,
        from: ReplicaId,
        to: ReplicaId,
        msg: CoordinationMessage,
    ) -> Result<CoordinationResponse, SendError> {
        if self.is_blocked(from, to) {
            return Err(SendError::Unreachable);
        }
        match self.get(to) {
            Some(node) => node.handle_message(from, msg),
            None => Err(SendError::Unreachable),
        }
    }
}

pub struct TestTopology {
    pub registry: Arc<ReplicaRegistry>,
    pub transport: Arc<LocalTransport>,
    config: CleanAllRuvConfig,
    stores: BTreeMap<ReplicaId, Arc<MemoryStateStore>>,
    nodes: Mutex<BTreeMap<ReplicaId, Arc<ReplicaNode>>>,
}

impl TestTopology {
    /// Start a node for each of `members`. No agreements are configured.
    pub async fn new(members: &[u16], config: CleanAllRuvConfig) -> Result<Self, OperationError> {
        sketching::test_init();
        let registry = Arc::new(ReplicaRegistry::default());
        for rid in members.iter().copied() {
            let endpoint = Url::parse(&format!("ldap://localhost:{}", 38900 + rid as u32))
                .map_err(|e| {
                    admin_error!(?e, "invalid test endpoint");
                    OperationError::InvalidState
                })?;
            registry.add_member(ReplicaId(rid), endpoint);
        }

        let topology = TestTopology {
            registry,
            transport: Arc::new(LocalTransport::default()),
            config,
            stores: members
                .iter()
                .map(|rid| (ReplicaId(*rid), Arc::new(MemoryStateStore::default())))
                .collect(),
            nodes: Mutex::new(BTreeMap::new()),
        };

        for rid in members.iter().copied() {
            topology.restart(rid).await?;
        }
        Ok(topology)
    }

    /// Members 1 to `n`, each with an agreement to every other member.
    pub async fn full_mesh(n: u16) -> Result<Self, OperationError> {
        Self::mesh(n, CleanAllRuvConfig::new_for_test()).await
    }

    /// As [`Self::full_mesh`], with every member started from `config`.
    pub async fn mesh(n: u16, config: CleanAllRuvConfig) -> Result<Self, OperationError> {
        let members: Vec<u16> = (1..=n).collect();
        let topology = Self::new(&members, config).await?;
        {
            let mut wr = topology.registry.write();
            for from in members.iter() {
                for to in members.iter().filter(|to| *to != from) {
                    wr.add_agreement(ReplicaId(*from), ReplicaId(*to));
                }
            }
            wr.commit();
        }
        Ok(topology)
    }

    pub fn node(&self, rid: u16) -> Option<Arc<ReplicaNode>> {
        self.nodes
            .lock()
            .ok()
            .and_then(|nodes| nodes.get(&ReplicaId(rid)).cloned())
    }

    pub fn store(&self, rid: u16) -> Option<Arc<MemoryStateStore>> {
        self.stores.get(&ReplicaId(rid)).cloned()
    }

    /// Stop a member as a crash would. Its store is kept for [`Self::restart`].
    pub fn stop(&self, rid: u16) {
        self.transport.detach(ReplicaId(rid));
        let node = self
            .nodes
            .lock()
            .ok()
            .and_then(|mut nodes| nodes.remove(&ReplicaId(rid)));
        if let Some(node) = node {
            node.shutdown();
        }
    }

    /// Start a member against its existing store, stopping it first if it is running.
    pub async fn restart(&self, rid: u16) -> Result<Arc<ReplicaNode>, OperationError> {
        self.stop(rid);
        let store = self.stores.get(&ReplicaId(rid)).cloned().ok_or_else(|| {
            admin_error!(%rid, "not a member of this topology");
            OperationError::InvalidState
        })?;
        let store: Arc<dyn ReplStateStore> = store;
        let node = ReplicaNode::start(
            ReplicaId(rid),
            &[TEST_BASE],
            self.config.clone(),
            self.registry.clone(),
            self.transport.clone(),
            store,
        )
        .await?;

        self.transport.attach(node.clone());
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(ReplicaId(rid), node.clone());
        }
        Ok(node)
    }

    /// Take a member out of service for good. It is stopped and removed from the
    /// topology along with all of its agreements.
    pub fn decommission(&self, rid: u16) {
        self.stop(rid);
        self.registry.remove_member(ReplicaId(rid));
    }

    /// Apply a change from `rid` at `secs` on every running member.
    pub fn seed(&self, rid: u16, secs: u64) -> Result<(), OperationError> {
        let csn = Csn::new(ReplicaId(rid), Duration::from_secs(secs));
        let nodes: Vec<Arc<ReplicaNode>> = self
            .nodes
            .lock()
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default();
        for node in nodes {
            node.apply_update(TEST_BASE, csn)?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let rids: Vec<ReplicaId> = self
            .nodes
            .lock()
            .map(|nodes| nodes.keys().copied().collect())
            .unwrap_or_default();
        for rid in rids {
            self.stop(rid.0);
        }
    }
}

impl Drop for TestTopology {
    fn drop(&mut self) {
        self.shutdown();
    }
}
