use log::{debug, info};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::decision::{now_ms, DecisionLog, DecisionRecord, Outcome};
use crate::errors::{DistTxnError, Result};
use crate::gid::{CoordinatorId, Gid};

const RECORD_PREFIX: &[u8] = b"rec/";
const GID_PREFIX: &[u8] = b"gid/";
const ACK_PREFIX: &[u8] = b"ack/";

/// Index entry stored under each GID of a record.
#[derive(Serialize, Deserialize)]
struct GidEntry {
    coordinator: CoordinatorId,
    local_xid: u64,
    outcome: Outcome,
}

/// Decision log persisted in RocksDB.
///
/// Every mutation is a single `WriteBatch` written with `sync` set, so a
/// record and its GID index entries become durable together.
pub struct RocksDecisionLog {
    db: DB,
}

impl RocksDecisionLog {
    /// Opens (creating if needed) the decision log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).map_err(storage_err)?;
        info!("decision log opened at {}", path.as_ref().display());
        Ok(Self { db })
    }

    fn sync_write(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).map_err(storage_err)
    }

    fn record_at(&self, coordinator: CoordinatorId, local_xid: u64) -> Result<Option<DecisionRecord>> {
        match self.db.get(record_key(coordinator, local_xid)).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec_err)?)),
            None => Ok(None),
        }
    }

    fn scan<T>(&self, prefix: &[u8], mut decode: impl FnMut(&[u8], &[u8]) -> Result<T>) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(decode(&key, &value)?);
        }
        Ok(out)
    }
}

impl DecisionLog for RocksDecisionLog {
    fn write(&self, record: &DecisionRecord) -> Result<()> {
        if let Some(existing) = self.record_at(record.coordinator, record.local_xid)? {
            if existing.outcome == record.outcome {
                return Ok(());
            }
            return Err(DistTxnError::Storage(format!(
                "transaction {} already decided {}",
                record.local_xid, existing.outcome
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put(
            record_key(record.coordinator, record.local_xid),
            bincode::serialize(record).map_err(codec_err)?,
        );
        for gid in &record.gids {
            let entry = GidEntry {
                coordinator: record.coordinator,
                local_xid: record.local_xid,
                outcome: record.outcome,
            };
            batch.put(gid_key(GID_PREFIX, gid), bincode::serialize(&entry).map_err(codec_err)?);
        }
        self.sync_write(batch)?;
        debug!("decision for transaction {} persisted: {}", record.local_xid, record.outcome);
        Ok(())
    }

    fn lookup(&self, gid: &Gid) -> Result<Option<Outcome>> {
        match self.db.get(gid_key(GID_PREFIX, gid)).map_err(storage_err)? {
            Some(bytes) => {
                let entry: GidEntry = bincode::deserialize(&bytes).map_err(codec_err)?;
                Ok(Some(entry.outcome))
            }
            None => Ok(None),
        }
    }

    fn acknowledge(&self, gid: &Gid) -> Result<()> {
        if self.db.get(gid_key(GID_PREFIX, gid)).map_err(storage_err)?.is_none() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        batch.put(gid_key(ACK_PREFIX, gid), b"");
        self.sync_write(batch)
    }

    fn records(&self) -> Result<Vec<DecisionRecord>> {
        self.scan(RECORD_PREFIX, |_, value| {
            bincode::deserialize(value).map_err(codec_err)
        })
    }

    fn collect_garbage(&self, retention: Duration) -> Result<usize> {
        let now = now_ms();
        let mut batch = WriteBatch::default();
        let mut removed = 0;

        for record in self.records()? {
            let mut all_acknowledged = true;
            for gid in &record.gids {
                if self.db.get(gid_key(ACK_PREFIX, gid)).map_err(storage_err)?.is_none() {
                    all_acknowledged = false;
                    break;
                }
            }
            if !all_acknowledged && !record.expired(retention, now) {
                continue;
            }

            batch.delete(record_key(record.coordinator, record.local_xid));
            for gid in &record.gids {
                batch.delete(gid_key(GID_PREFIX, gid));
                batch.delete(gid_key(ACK_PREFIX, gid));
            }
            removed += 1;
        }

        if removed > 0 {
            self.sync_write(batch)?;
            info!("decision log garbage collection removed {} records", removed);
        }
        Ok(removed)
    }
}

fn record_key(coordinator: CoordinatorId, local_xid: u64) -> Vec<u8> {
    let mut key = RECORD_PREFIX.to_vec();
    key.extend_from_slice(&coordinator.0.to_be_bytes());
    key.extend_from_slice(&local_xid.to_be_bytes());
    key
}

fn gid_key(prefix: &[u8], gid: &Gid) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(gid.encode().as_bytes());
    key
}

fn storage_err(e: rocksdb::Error) -> DistTxnError {
    DistTxnError::Storage(e.to_string())
}

fn codec_err(e: bincode::Error) -> DistTxnError {
    DistTxnError::Storage(format!("decision record encoding: {e}"))
}
