use std::collections::BTreeMap;
use std::fmt;

use concread::bptree::{BptreeMap, BptreeMapReadSnapshot, BptreeMapReadTxn, BptreeMapWriteTxn};

use crate::prelude::*;

/// The update vector of one replicated base. This records, per replica id, the range of
/// changes that replica id has contributed as observed by this server.
///
/// Readers take a read transaction and see a consistent point in time view, even while
/// a writer removes a replica id. A write is only visible once it has been persisted
/// and committed.
pub struct ReplicationUpdateVector {
    base: String,
    data: BptreeMap<ReplicaId, RuvRange>,
}

pub struct ReplicationUpdateVectorWriteTransaction<'a> {
    base: &'a str,
    data: BptreeMapWriteTxn<'a, ReplicaId, RuvRange>,
}

impl<'a> fmt::Debug for ReplicationUpdateVectorWriteTransaction<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RUV DUMP {}", self.base)?;
        self.data.iter().try_for_each(|(rid, range)| {
            writeln!(f, "* [{rid} {} .. {}]", range.csn_min, range.csn_max)
        })
    }
}

pub struct ReplicationUpdateVectorReadTransaction<'a> {
    data: BptreeMapReadTxn<'a, ReplicaId, RuvRange>,
}

impl ReplicationUpdateVector {
    pub fn new(base: &str) -> Self {
        ReplicationUpdateVector {
            base: base.to_string(),
            data: BptreeMap::new(),
        }
    }

    /// Rebuild the update vector of `base` from the store, or start empty if this base
    /// has never been written.
    pub fn load(base: &str, store: &dyn ReplStateStore) -> Result<Self, OperationError> {
        let ruv = Self::new(base);
        if let Some(existing) = store.load_ruv(base)? {
            let mut wr = ruv.data.write();
            wr.extend(existing);
            wr.commit();
        }
        Ok(ruv)
    }

    pub fn base(&self) -> &str {
        self.base.as_str()
    }

    pub fn write(&self) -> ReplicationUpdateVectorWriteTransaction<'_> {
        ReplicationUpdateVectorWriteTransaction {
            base: self.base.as_str(),
            data: self.data.write(),
        }
    }

    pub fn read(&self) -> ReplicationUpdateVectorReadTransaction<'_> {
        ReplicationUpdateVectorReadTransaction {
            data: self.data.read(),
        }
    }
}

pub trait ReplicationUpdateVectorTransaction {
    fn ruv_snapshot(&self) -> BptreeMapReadSnapshot<'_, ReplicaId, RuvRange>;

    fn current_ruv_range(&self) -> BTreeMap<ReplicaId, RuvRange> {
        self.ruv_snapshot()
            .iter()
            .map(|(rid, range)| (*rid, *range))
            .collect()
    }

    fn contains_replica_id(&self, rid: ReplicaId) -> bool {
        self.ruv_snapshot().get(&rid).is_some()
    }

    /// The newest change from `rid` that this server has applied.
    fn max_csn(&self, rid: ReplicaId) -> Option<Csn> {
        self.ruv_snapshot().get(&rid).map(|range| range.csn_max)
    }
}

impl<'a> ReplicationUpdateVectorTransaction for ReplicationUpdateVectorWriteTransaction<'a> {
    fn ruv_snapshot(&self) -> BptreeMapReadSnapshot<'_, ReplicaId, RuvRange> {
        self.data.to_snapshot()
    }
}

impl<'a> ReplicationUpdateVectorTransaction for ReplicationUpdateVectorReadTransaction<'a> {
    fn ruv_snapshot(&self) -> BptreeMapReadSnapshot<'_, ReplicaId, RuvRange> {
        self.data.to_snapshot()
    }
}

impl<'a> ReplicationUpdateVectorWriteTransaction<'a> {
    /// Record that the change `csn` has been applied on this server.
    pub fn insert_change(&mut self, csn: Csn) {
        // Remember, in a transaction the changes can be updated multiple times.
        if let Some(range) = self.data.get_mut(&csn.rid) {
            if csn < range.csn_min {
                range.csn_min = csn;
            }
            if csn > range.csn_max {
                range.csn_max = csn;
            }
        } else {
            self.data.insert(
                csn.rid,
                RuvRange {
                    csn_min: csn,
                    csn_max: csn,
                },
            );
        }
    }

    /// Remove `rid` from this update vector. Returns true if it was present.
    pub fn remove_replica_id(&mut self, rid: ReplicaId) -> bool {
        self.data.remove(&rid).is_some()
    }

    /// Persist, then make visible to readers. If the persist fails the transaction is
    /// dropped and readers continue to see the prior state.
    pub fn commit(self, store: &dyn ReplStateStore) -> Result<(), OperationError> {
        let ruv = self.current_ruv_range();
        store.write_ruv(self.base, &ruv).map_err(|e| {
            admin_error!(?e, base = %self.base, "Unable to persist update vector");
            e
        })?;
        self.data.commit();
        perf_trace!(base = %self.base, entries = ruv.len(), "update vector committed");
        Ok(())
    }
}
