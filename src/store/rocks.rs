//! RocksDB-backed store
//!
//! Column families:
//! - `sdb`: metadata log records, keyed by a big-endian sequence number
//! - `trans`: transaction snapshots, keyed by big-endian transaction id
//! - `meta`: counters (`last_trans_id`)

use crate::common::{Error, Result};
use crate::store::{LogBatch, MetaStore, StoreAck};
use crate::trans::record::TransId;
use bytes::Bytes;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use std::path::Path;
use std::sync::Mutex;

const CF_SDB: &str = "sdb";
const CF_TRANS: &str = "trans";
const CF_META: &str = "meta";
const KEY_LAST_TRANS_ID: &[u8] = b"last_trans_id";

#[derive(Debug)]
struct Counters {
    next_log_seq: u64,
    last_trans_id: TransId,
}

pub struct RocksStore {
    db: DB,
    /// Serializes batch construction so sequence numbers stay ordered
    counters: Mutex<Counters>,
}

impl RocksStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_SDB, CF_TRANS, CF_META])?;

        let next_log_seq = {
            let cf = cf(&db, CF_SDB)?;
            match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_u64(&key)? + 1
                }
                None => 0,
            }
        };
        let last_trans_id = match db.get_cf(cf(&db, CF_META)?, KEY_LAST_TRANS_ID)? {
            Some(raw) => decode_u64(&raw)?,
            None => 0,
        };

        tracing::info!(
            next_log_seq = next_log_seq,
            last_trans_id = last_trans_id,
            "metadata store opened"
        );

        Ok(Self {
            db,
            counters: Mutex::new(Counters {
                next_log_seq,
                last_trans_id,
            }),
        })
    }

    /// Metadata log records in write order
    pub fn read_logs(&self) -> Result<Vec<Bytes>> {
        let cf = cf(&self.db, CF_SDB)?;
        let mut logs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            logs.push(Bytes::from(value.into_vec()));
        }
        Ok(logs)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
}

fn decode_u64(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Corrupted(format!("expected 8-byte key, got {}", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

impl MetaStore for RocksStore {
    fn append_atomic_batch(&self, batch: &LogBatch) -> Result<StoreAck> {
        let mut counters = self.counters.lock()?;
        let sdb = cf(&self.db, CF_SDB)?;
        let trans = cf(&self.db, CF_TRANS)?;
        let meta = cf(&self.db, CF_META)?;

        let mut wb = WriteBatch::default();
        let mut seq = counters.next_log_seq;
        for log in &batch.logs {
            wb.put_cf(sdb, seq.to_be_bytes(), log);
            seq += 1;
        }
        let trans_key = batch.trans_id.to_be_bytes();
        if batch.finalize {
            wb.delete_cf(trans, trans_key);
        } else {
            wb.put_cf(trans, trans_key, &batch.snapshot);
        }
        let last_trans_id = counters.last_trans_id.max(batch.trans_id);
        wb.put_cf(meta, KEY_LAST_TRANS_ID, last_trans_id.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(wb, &write_opts)
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;

        counters.next_log_seq = seq;
        counters.last_trans_id = last_trans_id;
        Ok(StoreAck::Committed)
    }

    fn iterate_on_startup(&self) -> Result<Vec<Bytes>> {
        let cf = cf(&self.db, CF_TRANS)?;
        let mut snapshots = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            snapshots.push(Bytes::from(value.into_vec()));
        }
        Ok(snapshots)
    }

    fn load_trans(&self, trans_id: TransId) -> Result<Option<Bytes>> {
        let cf = cf(&self.db, CF_TRANS)?;
        Ok(self
            .db
            .get_cf(cf, trans_id.to_be_bytes())?
            .map(Bytes::from))
    }

    fn last_trans_id(&self) -> Result<TransId> {
        Ok(self.counters.lock()?.last_trans_id)
    }
}
