use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;
use parking_lot::RwLock;
use std::time::Duration;

use crate::decision::{now_ms, DecisionLog, DecisionRecord, Outcome};
use crate::errors::{DistTxnError, Result};
use crate::gid::{CoordinatorId, Gid};

type RecordKey = (CoordinatorId, u64);

#[derive(Default)]
struct Inner {
    records: HashMap<RecordKey, DecisionRecord>,
    by_gid: HashMap<Gid, RecordKey>,
    acknowledged: HashSet<Gid>,
}

/// Decision log kept in process memory.
///
/// Not crash-safe; meant for tests and for hosts that persist decisions
/// through another channel.
#[derive(Default)]
pub struct MemoryDecisionLog {
    inner: RwLock<Inner>,
}

impl MemoryDecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the record of one local transaction, as if it had never been
    /// written. Used to simulate a coordinator that crashed before deciding.
    pub fn forget(&self, coordinator: CoordinatorId, local_xid: u64) -> Option<DecisionRecord> {
        let mut inner = self.inner.write();
        let record = inner.records.remove(&(coordinator, local_xid))?;
        for gid in &record.gids {
            inner.by_gid.remove(gid);
            inner.acknowledged.remove(gid);
        }
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DecisionLog for MemoryDecisionLog {
    fn write(&self, record: &DecisionRecord) -> Result<()> {
        let key = (record.coordinator, record.local_xid);
        let mut inner = self.inner.write();
        if let Some(existing) = inner.records.get(&key) {
            if existing.outcome == record.outcome {
                return Ok(());
            }
            return Err(DistTxnError::Storage(format!(
                "transaction {} already decided {}",
                record.local_xid, existing.outcome
            )));
        }
        for gid in &record.gids {
            inner.by_gid.insert(*gid, key);
        }
        inner.records.insert(key, record.clone());
        debug!("decision for transaction {} recorded: {}", record.local_xid, record.outcome);
        Ok(())
    }

    fn lookup(&self, gid: &Gid) -> Result<Option<Outcome>> {
        let inner = self.inner.read();
        Ok(inner
            .by_gid
            .get(gid)
            .and_then(|key| inner.records.get(key))
            .map(|record| record.outcome))
    }

    fn acknowledge(&self, gid: &Gid) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.by_gid.contains_key(gid) {
            inner.acknowledged.insert(*gid);
        }
        Ok(())
    }

    fn records(&self) -> Result<Vec<DecisionRecord>> {
        let mut records: Vec<_> = self.inner.read().records.values().cloned().collect();
        records.sort_by_key(|r| (r.coordinator, r.local_xid));
        Ok(records)
    }

    fn collect_garbage(&self, retention: Duration) -> Result<usize> {
        let now = now_ms();
        let mut inner = self.inner.write();
        let doomed: Vec<RecordKey> = inner
            .records
            .iter()
            .filter(|(_, record)| {
                record.expired(retention, now)
                    || record.gids.iter().all(|gid| inner.acknowledged.contains(gid))
            })
            .map(|(key, _)| *key)
            .collect();

        for key in &doomed {
            if let Some(record) = inner.records.remove(key) {
                for gid in &record.gids {
                    inner.by_gid.remove(gid);
                    inner.acknowledged.remove(gid);
                }
            }
        }
        Ok(doomed.len())
    }
}
