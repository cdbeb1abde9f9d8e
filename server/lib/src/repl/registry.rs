//! The intended membership of the topology, and the directed agreements between members.
//!
//! An operator may add or remove agreements while a clean is in flight, so task state
//! machines must take a fresh read at each phase rather than hold one across phases.
//! Reachability is advisory only. It is fed from delivery outcomes and never decides
//! whether a member may be skipped for safety.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use concread::cowcell::{CowCell, CowCellReadTxn, CowCellWriteTxn};

use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMember {
    pub rid: ReplicaId,
    pub endpoint: Url,
}

#[derive(Debug, Clone, Default)]
struct TopologyInner {
    members: BTreeMap<ReplicaId, ReplicaMember>,
    // (supplier, consumer)
    agreements: BTreeSet<(ReplicaId, ReplicaId)>,
}

pub struct ReplicaRegistry {
    inner: CowCell<TopologyInner>,
    unreachable: Mutex<BTreeSet<ReplicaId>>,
}

pub struct ReplicaRegistryReadTransaction {
    inner: CowCellReadTxn<TopologyInner>,
}

pub struct ReplicaRegistryWriteTransaction<'a> {
    inner: CowCellWriteTxn<'a, TopologyInner>,
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        ReplicaRegistry {
            inner: CowCell::new(TopologyInner::default()),
            unreachable: Mutex::new(BTreeSet::new()),
        }
    }
}

impl ReplicaRegistry {
    pub fn read(&self) -> ReplicaRegistryReadTransaction {
        ReplicaRegistryReadTransaction {
            inner: self.inner.read(),
        }
    }

    pub fn write(&self) -> ReplicaRegistryWriteTransaction<'_> {
        ReplicaRegistryWriteTransaction {
            inner: self.inner.write(),
        }
    }

    pub fn members(&self) -> BTreeSet<ReplicaId> {
        self.read().members()
    }

    pub fn agreements_from(&self, rid: ReplicaId) -> BTreeSet<ReplicaId> {
        self.read().agreements_from(rid)
    }

    pub fn agreements_to(&self, rid: ReplicaId) -> BTreeSet<ReplicaId> {
        self.read().agreements_to(rid)
    }

    pub fn is_reachable(&self, rid: ReplicaId) -> bool {
        self.unreachable
            .lock()
            .map(|u| !u.contains(&rid))
            .unwrap_or(true)
    }

    pub fn set_reachable(&self, rid: ReplicaId, reachable: bool) {
        if let Ok(mut u) = self.unreachable.lock() {
            let changed = if reachable {
                u.remove(&rid)
            } else {
                u.insert(rid)
            };
            if changed {
                request_info!(%rid, reachable, "replica reachability changed");
            }
        }
    }

    /// Single step helpers for operators and tests. Each is its own committed write.
    pub fn add_member(&self, rid: ReplicaId, endpoint: Url) {
        let mut wr = self.write();
        wr.add_member(rid, endpoint);
        wr.commit();
    }

    pub fn remove_member(&self, rid: ReplicaId) {
        let mut wr = self.write();
        wr.remove_member(rid);
        wr.commit();
    }

    pub fn add_agreement(&self, from: ReplicaId, to: ReplicaId) {
        let mut wr = self.write();
        wr.add_agreement(from, to);
        wr.commit();
    }

    pub fn remove_agreement(&self, from: ReplicaId, to: ReplicaId) {
        let mut wr = self.write();
        wr.remove_agreement(from, to);
        wr.commit();
    }
}

impl ReplicaRegistryReadTransaction {
    pub fn members(&self) -> BTreeSet<ReplicaId> {
        self.inner.members.keys().copied().collect()
    }

    pub fn member(&self, rid: ReplicaId) -> Option<&ReplicaMember> {
        self.inner.members.get(&rid)
    }

    pub fn agreements_from(&self, rid: ReplicaId) -> BTreeSet<ReplicaId> {
        self.inner
            .agreements
            .iter()
            .filter_map(|(from, to)| if *from == rid { Some(*to) } else { None })
            .collect()
    }

    pub fn agreements_to(&self, rid: ReplicaId) -> BTreeSet<ReplicaId> {
        self.inner
            .agreements
            .iter()
            .filter_map(|(from, to)| if *to == rid { Some(*from) } else { None })
            .collect()
    }

    /// Every member reachable from `origin` by following agreements, never passing
    /// through `exclude`. Neither `origin` nor `exclude` is in the result.
    pub fn reachable_from(&self, origin: ReplicaId, exclude: ReplicaId) -> BTreeSet<ReplicaId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([origin]);

        while let Some(next) = queue.pop_front() {
            for to in self.agreements_from(next) {
                if to == exclude || to == origin {
                    continue;
                }
                if seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
        seen
    }
}

impl<'a> ReplicaRegistryWriteTransaction<'a> {
    pub fn add_member(&mut self, rid: ReplicaId, endpoint: Url) {
        self.inner
            .get_mut()
            .members
            .insert(rid, ReplicaMember { rid, endpoint });
    }

    /// Removing a member also removes every agreement that touches it.
    pub fn remove_member(&mut self, rid: ReplicaId) {
        let inner = self.inner.get_mut();
        inner.members.remove(&rid);
        inner.agreements.retain(|(from, to)| *from != rid && *to != rid);
    }

    pub fn add_agreement(&mut self, from: ReplicaId, to: ReplicaId) {
        self.inner.get_mut().agreements.insert((from, to));
    }

    pub fn remove_agreement(&mut self, from: ReplicaId, to: ReplicaId) {
        self.inner.get_mut().agreements.remove(&(from, to));
    }

    pub fn commit(self) {
        self.inner.commit();
    }
}
