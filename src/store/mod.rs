//! Durable metadata store interface
//!
//! The coordinator writes two kinds of data through one atomic batch:
//! opaque metadata log records (redo, commit and undo logs) and the snapshot
//! of the transaction record that produced them. Replaying the snapshots on
//! startup is how in-flight transactions are recovered.

pub mod memory;
pub mod rocks;

use crate::common::Result;
use crate::trans::record::TransId;
use bytes::Bytes;

pub use memory::MemStore;
pub use rocks::RocksStore;

/// One all-or-nothing write
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub trans_id: TransId,
    /// Opaque metadata records, applied in order
    pub logs: Vec<Bytes>,
    /// Encoded record snapshot; also the payload handed back on acknowledgement
    pub snapshot: Bytes,
    /// Remove the stored record instead of replacing it
    pub finalize: bool,
}

/// How far a batch got when `append_atomic_batch` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAck {
    /// Durable and replicated; the caller may proceed
    Committed,
    /// Accepted locally; the replication layer calls
    /// [`TransManager::apply`](crate::trans::TransManager::apply) once a quorum has it
    Pending,
}

pub trait MetaStore: Send + Sync {
    /// Write `batch` atomically.
    ///
    /// # Errors
    ///
    /// Any error means nothing from the batch was written.
    fn append_atomic_batch(&self, batch: &LogBatch) -> Result<StoreAck>;

    /// Encoded snapshots of every stored (unfinalized) transaction
    fn iterate_on_startup(&self) -> Result<Vec<Bytes>>;

    /// Stored snapshot of one transaction, `None` once finalized
    fn load_trans(&self, trans_id: TransId) -> Result<Option<Bytes>>;

    /// Highest transaction id ever written, 0 if none
    fn last_trans_id(&self) -> Result<TransId>;
}
