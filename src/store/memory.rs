//! In-process store, used by tests and single-node setups without disk

use crate::common::{Error, Result};
use crate::store::{LogBatch, MetaStore, StoreAck};
use crate::trans::record::TransId;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    logs: Vec<Bytes>,
    trans: BTreeMap<TransId, Bytes>,
    last_trans_id: TransId,
    batches: usize,
}

/// Memory-backed [`MetaStore`] with fault injection
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
    /// Fail this many upcoming batches
    fail_next: AtomicUsize,
    /// Answer `Pending` instead of `Committed`
    deferred_ack: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` batches with a persistence error
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Report writes as pending replication
    pub fn set_deferred_ack(&self, deferred: bool) {
        self.deferred_ack.store(deferred, Ordering::SeqCst);
    }

    /// Every metadata log record written so far, in order
    pub fn logs(&self) -> Vec<Bytes> {
        self.inner.lock().map(|i| i.logs.clone()).unwrap_or_default()
    }

    pub fn contains_log(&self, raw: &[u8]) -> bool {
        self.logs().iter().any(|l| l.as_ref() == raw)
    }

    /// Stored snapshot of one transaction
    pub fn snapshot(&self, trans_id: TransId) -> Option<Bytes> {
        self.inner.lock().ok()?.trans.get(&trans_id).cloned()
    }

    /// Number of batches accepted
    pub fn batch_count(&self) -> usize {
        self.inner.lock().map(|i| i.batches).unwrap_or(0)
    }
}

impl MetaStore for MemStore {
    fn append_atomic_batch(&self, batch: &LogBatch) -> Result<StoreAck> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::PersistenceFailure(format!(
                "injected failure for trans:{}",
                batch.trans_id
            )));
        }

        let mut inner = self.inner.lock()?;
        inner.logs.extend(batch.logs.iter().cloned());
        if batch.finalize {
            inner.trans.remove(&batch.trans_id);
        } else {
            inner.trans.insert(batch.trans_id, batch.snapshot.clone());
        }
        inner.last_trans_id = inner.last_trans_id.max(batch.trans_id);
        inner.batches += 1;

        if self.deferred_ack.load(Ordering::SeqCst) {
            Ok(StoreAck::Pending)
        } else {
            Ok(StoreAck::Committed)
        }
    }

    fn iterate_on_startup(&self) -> Result<Vec<Bytes>> {
        Ok(self.inner.lock()?.trans.values().cloned().collect())
    }

    fn load_trans(&self, trans_id: TransId) -> Result<Option<Bytes>> {
        Ok(self.inner.lock()?.trans.get(&trans_id).cloned())
    }

    fn last_trans_id(&self) -> Result<TransId> {
        Ok(self.inner.lock()?.last_trans_id)
    }
}
