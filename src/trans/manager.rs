//! Transaction manager
//!
//! Owns every live [`TransRecord`] and is the only entry point that moves
//! them: caller submissions (`prepare`), worker replies
//! (`handle_action_rsp`), replication acknowledgements (`apply`) and the
//! periodic sweep. Each record sits behind its own mutex; the registry lock is
//! only taken to insert, remove or look up an entry, never while a record lock
//! is held.

use crate::common::{
    backoff_delay_ms, format_timestamp_millis, timestamp_now_millis, Error, Result, TransConfig,
};
use crate::rpc::{ActionResponse, RequestHandle, Transport};
use crate::store::{LogBatch, MetaStore};
use crate::trans::action::{ActionKind, Endpoint};
use crate::trans::code;
use crate::trans::conflict::{AdmissionTable, ConflictTable};
use crate::trans::dispatcher::{self, ReplyEffect};
use crate::trans::record::{LastError, TransId, TransPolicy, TransRecord};
use crate::trans::stage::{self, StageCtx, StageOutcome, TransEvent, TransStage};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

const EVENT_CAPACITY: usize = 1024;

type Entry = Arc<Mutex<TransRecord>>;

/// Listing row for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct TransSummary {
    pub id: TransId,
    pub name: String,
    pub policy: TransPolicy,
    pub stage: TransStage,
    pub created_at: String,
    pub last_exec_at: String,
    pub failed_times: u32,
    pub pending_actions: usize,
    pub cancel_requested: bool,
    pub stalled: bool,
    /// False while a restored record waits for its resources
    pub admitted: bool,
    pub last_error: Option<LastError>,
}

impl TransSummary {
    fn of(record: &TransRecord) -> Self {
        let pending_actions = record
            .stage
            .action_kind()
            .map(|kind| record.actions(kind).iter().filter(|a| !a.is_satisfied()).count())
            .unwrap_or(0);
        Self {
            id: record.id,
            name: record.name.clone(),
            policy: record.policy,
            stage: record.stage,
            created_at: format_timestamp_millis(record.created_at),
            last_exec_at: format_timestamp_millis(record.last_exec_at),
            failed_times: record.failed_times,
            pending_actions,
            cancel_requested: record.cancel_requested,
            stalled: record.stalled,
            admitted: record.admitted,
            last_error: record.last_error.clone(),
        }
    }
}

/// Ids that were prepared or restored here. Everything below `floor` counts
/// as seen, starting from the store's high-water mark.
#[derive(Debug)]
struct SeenIds {
    floor: TransId,
    above: BTreeSet<TransId>,
}

impl SeenIds {
    fn new(floor: TransId) -> Self {
        Self {
            floor,
            above: BTreeSet::new(),
        }
    }

    /// False if `id` was seen before
    fn insert(&mut self, id: TransId) -> bool {
        if id < self.floor || !self.above.insert(id) {
            return false;
        }
        while self.above.remove(&self.floor) {
            self.floor += 1;
        }
        true
    }
}

pub struct TransManager {
    config: TransConfig,
    store: Arc<dyn MetaStore>,
    transport: Arc<dyn Transport>,
    conflicts: Arc<dyn AdmissionTable>,
    trans: RwLock<HashMap<TransId, Entry>>,
    next_id: AtomicU64,
    seen: Mutex<SeenIds>,
    events: broadcast::Sender<TransEvent>,
    wakeup: Notify,
}

impl TransManager {
    pub fn new(
        config: TransConfig,
        store: Arc<dyn MetaStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::with_admission(config, store, transport, Arc::new(ConflictTable::new()))
    }

    pub fn with_admission(
        config: TransConfig,
        store: Arc<dyn MetaStore>,
        transport: Arc<dyn Transport>,
        conflicts: Arc<dyn AdmissionTable>,
    ) -> Result<Self> {
        config.validate()?;
        let last_id = store.last_trans_id()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            config,
            store,
            transport,
            conflicts,
            trans: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(last_id + 1),
            seen: Mutex::new(SeenIds::new(last_id + 1)),
            events,
            wakeup: Notify::new(),
        })
    }

    pub fn config(&self) -> &TransConfig {
        &self.config
    }

    fn ctx(&self, now: u64, fail_fast: bool) -> StageCtx<'_> {
        StageCtx {
            store: self.store.as_ref(),
            transport: self.transport.as_ref(),
            conflicts: self.conflicts.as_ref(),
            config: &self.config,
            events: &self.events,
            now,
            fail_fast,
        }
    }

    fn lookup(&self, id: TransId) -> Result<Option<Entry>> {
        Ok(self.trans.read()?.get(&id).cloned())
    }

    fn remove(&self, id: TransId) {
        if let Ok(mut trans) = self.trans.write() {
            trans.remove(&id);
        }
    }

    /// Take the record's resources if it does not hold them yet
    fn admit(&self, record: &mut TransRecord) -> Result<()> {
        if record.admitted {
            return Ok(());
        }
        self.conflicts.try_acquire(record.id, &record.resources)?;
        record.admitted = true;
        tracing::debug!(trans_id = record.id, stage = %record.stage, "transaction admitted");
        Ok(())
    }

    /// Run the driver and swallow errors into `last_error`. True once the
    /// record is finalized. A record without its resources is not driven.
    fn drive_logged(&self, ctx: &StageCtx<'_>, record: &mut TransRecord) -> bool {
        if let Err(e) = self.admit(record) {
            tracing::debug!(trans_id = record.id, "waiting for resources: {}", e);
            return false;
        }
        match stage::drive(ctx, record) {
            Ok(StageOutcome::Done) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::error!(trans_id = record.id, stage = %record.stage, "stage driver failed: {}", e);
                record.set_error(e.code(), e.to_string());
                false
            }
        }
    }

    /// Write the current snapshot so action status survives a restart.
    /// Only action stages are persisted this way; a log stage snapshot would
    /// replay its logs on recovery. A failed write is retried by the sweep.
    fn persist_status(&self, record: &mut TransRecord, now: u64) {
        if record.stage.action_kind().is_none() {
            record.status_retry_at = 0;
            return;
        }
        let result = record.encode().and_then(|snapshot| {
            self.store.append_atomic_batch(&LogBatch {
                trans_id: record.id,
                logs: Vec::new(),
                snapshot,
                finalize: false,
            })
        });
        match result {
            Ok(_) => record.status_retry_at = 0,
            Err(e) => {
                record.status_retry_at = now
                    + backoff_delay_ms(1, self.config.retry_backoff_ms, self.config.retry_backoff_max_ms);
                tracing::warn!(
                    trans_id = record.id,
                    stage = %record.stage,
                    retry_at = record.status_retry_at,
                    "status snapshot write failed: {}",
                    e
                );
            }
        }
    }

    /// A fresh record with the next transaction id
    pub fn create(&self, policy: TransPolicy, origin: Option<Endpoint>) -> TransRecord {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(trans_id = id, policy = %policy, "transaction created");
        TransRecord::new(id, policy, origin)
    }

    /// Admit, persist and start driving `record`.
    ///
    /// # Errors
    ///
    /// `Conflict` when a declared resource is held by another transaction,
    /// `PersistenceFailure` when the redo log batch cannot be written. In both
    /// cases nothing is registered and no resource stays held.
    pub fn prepare(&self, record: TransRecord) -> Result<TransId> {
        self.prepare_at(record, timestamp_now_millis())
    }

    pub fn prepare_at(&self, mut record: TransRecord, now: u64) -> Result<TransId> {
        if record.stage != TransStage::Created {
            return Err(Error::InvalidState(format!(
                "trans:{} cannot be prepared at stage {}",
                record.id, record.stage
            )));
        }
        let id = record.id;
        if !self.seen.lock()?.insert(id) {
            return Err(Error::InvalidState(format!("trans:{} already prepared", id)));
        }

        if let Err(e) = self.admit(&mut record) {
            tracing::info!(trans_id = id, name = %record.name, "transaction rejected: {}", e);
            return Err(e);
        }
        tracing::info!(
            trans_id = id,
            name = %record.name,
            policy = %record.policy,
            redo_actions = record.redo_actions.len(),
            undo_actions = record.undo_actions.len(),
            commit_actions = record.commit_actions.len(),
            "preparing transaction"
        );

        let entry = Arc::new(Mutex::new(record));
        self.trans.write()?.insert(id, Arc::clone(&entry));

        let result = {
            let mut record = entry.lock()?;
            let ctx = self.ctx(now, true);
            stage::drive(&ctx, &mut record).map_err(|e| (e, record.stage))
        };
        match result {
            Ok(StageOutcome::Done) => self.remove(id),
            Ok(_) => {}
            Err((e, at)) if at <= TransStage::RedoLog => {
                self.remove(id);
                self.conflicts.release(id);
                tracing::warn!(trans_id = id, "prepare failed: {}", e);
                return Err(e);
            }
            Err((e, at)) => {
                // Already durable; the sweep takes it from here.
                tracing::error!(trans_id = id, stage = %at, "stage driver failed after prepare: {}", e);
                if let Ok(mut record) = entry.lock() {
                    record.set_error(e.code(), e.to_string());
                }
            }
        }
        self.wakeup.notify_one();
        Ok(id)
    }

    /// Route a worker reply (or synthesized timeout) to its record
    pub fn handle_action_rsp(&self, handle: RequestHandle, code: i32, reply: Bytes) -> Result<()> {
        self.handle_action_rsp_at(handle, code, reply, timestamp_now_millis())
    }

    pub fn handle_action_rsp_at(
        &self,
        handle: RequestHandle,
        code: i32,
        reply: Bytes,
        now: u64,
    ) -> Result<()> {
        let Some(entry) = self.lookup(handle.trans_id)? else {
            tracing::debug!(trans_id = handle.trans_id, "reply for unknown transaction ignored");
            return Ok(());
        };

        let done = {
            let mut record = entry.lock()?;
            if record.finalized {
                return Ok(());
            }
            if !record.admitted {
                tracing::debug!(trans_id = handle.trans_id, "reply for a transaction waiting on resources ignored");
                return Ok(());
            }
            match dispatcher::apply_reply(&mut record, &handle, code, now, &self.config) {
                ReplyEffect::Stale => {
                    tracing::debug!(
                        trans_id = handle.trans_id,
                        kind = %handle.kind,
                        action = handle.index,
                        epoch = handle.epoch,
                        "stale reply ignored"
                    );
                    return Ok(());
                }
                ReplyEffect::Updated => {}
            }
            tracing::debug!(
                trans_id = handle.trans_id,
                kind = %handle.kind,
                action = handle.index,
                code = %code::code_str(code),
                reply_len = reply.len(),
                "reply applied"
            );
            self.persist_status(&mut record, now);
            let ctx = self.ctx(now, false);
            self.drive_logged(&ctx, &mut record)
        };

        if done {
            self.remove(handle.trans_id);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Replication acknowledgement for a batch written with a `Pending` ack.
    ///
    /// `raw` is the snapshot carried by the acknowledged batch and `origin`
    /// the endpoint of the request that produced the write, when known.
    pub fn apply(&self, raw: &[u8], origin: Option<Endpoint>, code: i32) -> Result<()> {
        self.apply_at(raw, origin, code, timestamp_now_millis())
    }

    pub fn apply_at(&self, raw: &[u8], origin: Option<Endpoint>, code: i32, now: u64) -> Result<()> {
        let acked = TransRecord::decode(raw)?;
        let id = acked.id;

        let Some(entry) = self.lookup(id)? else {
            if code != code::SUCCESS || acked.stage.is_terminal() {
                tracing::debug!(trans_id = id, stage = %acked.stage, code = code, "ack for unknown transaction ignored");
                return Ok(());
            }
            return self.adopt(id, origin, now);
        };

        let done = {
            let mut record = entry.lock()?;
            if record.awaiting_ack != Some(acked.stage) {
                tracing::debug!(trans_id = id, stage = %acked.stage, "ack for a settled write ignored");
                return Ok(());
            }
            record.awaiting_ack = None;
            let ctx = self.ctx(now, false);
            if code == code::SUCCESS {
                record.persist_retry_at = 0;
                if let Err(e) = stage::transition(&ctx, &mut record, acked.stage) {
                    tracing::error!(trans_id = id, "acknowledged stage rejected: {}", e);
                    record.set_error(e.code(), e.to_string());
                    return Ok(());
                }
                self.drive_logged(&ctx, &mut record)
            } else {
                stage::schedule_persist_retry(
                    &ctx,
                    &mut record,
                    &format!("replication rejected write: {}", code::code_str(code)),
                );
                false
            }
        };

        if done {
            self.remove(id);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Take over a transaction this node did not start. The stored copy is
    /// authoritative; a record already finalized in the store is left alone.
    fn adopt(&self, id: TransId, origin: Option<Endpoint>, now: u64) -> Result<()> {
        let Some(raw) = self.store.load_trans(id)? else {
            tracing::debug!(trans_id = id, "ack for finalized transaction ignored");
            return Ok(());
        };
        let mut record = TransRecord::decode(&raw)?;
        if record.stage.is_terminal() {
            return Ok(());
        }
        if record.origin.is_none() {
            record.origin = origin;
        }
        tracing::info!(trans_id = id, stage = %record.stage, "adopting transaction");
        self.restore(record, now)?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Register a record loaded from the store and resume it. A record whose
    /// resources are held by another transaction is registered but sends
    /// nothing until the sweep can admit it.
    fn restore(&self, mut record: TransRecord, now: u64) -> Result<()> {
        let id = record.id;
        record.reset_in_flight();
        record.admitted = false;
        if let Err(e) = self.admit(&mut record) {
            tracing::warn!(trans_id = id, stage = %record.stage, "restored transaction waits for resources: {}", e);
        }
        self.seen.lock()?.insert(id);
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);

        let entry = Arc::new(Mutex::new(record));
        self.trans.write()?.insert(id, Arc::clone(&entry));

        let done = {
            let mut record = entry.lock()?;
            let ctx = self.ctx(now, false);
            self.drive_logged(&ctx, &mut record)
        };
        if done {
            self.remove(id);
        }
        Ok(())
    }

    /// Reload every unfinished transaction from the store and resume it.
    /// Returns how many were restored.
    pub fn init_trans(&self) -> Result<usize> {
        self.init_trans_at(timestamp_now_millis())
    }

    pub fn init_trans_at(&self, now: u64) -> Result<usize> {
        let last_id = self.store.last_trans_id()?;
        self.next_id.fetch_max(last_id + 1, Ordering::SeqCst);

        let mut restored = 0;
        for raw in self.store.iterate_on_startup()? {
            let record = match TransRecord::decode(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("skipping unreadable transaction snapshot: {}", e);
                    continue;
                }
            };
            if record.stage.is_terminal() {
                tracing::warn!(trans_id = record.id, stage = %record.stage, "stored transaction already terminal, skipped");
                continue;
            }
            if self.trans.read()?.contains_key(&record.id) {
                continue;
            }
            tracing::info!(
                trans_id = record.id,
                name = %record.name,
                stage = %record.stage,
                "restoring transaction"
            );
            self.restore(record, now)?;
            restored += 1;
        }

        tracing::info!(
            restored = restored,
            next_id = self.next_id.load(Ordering::SeqCst),
            "transaction recovery complete"
        );
        self.wakeup.notify_one();
        Ok(restored)
    }

    /// Forget every live record and release their resources. Durable state
    /// is untouched.
    pub fn cleanup_trans(&self) -> Result<()> {
        let drained: Vec<TransId> = self.trans.write()?.drain().map(|(id, _)| id).collect();
        for id in &drained {
            self.conflicts.release(*id);
        }
        tracing::info!(count = drained.len(), "transaction registry drained");
        Ok(())
    }

    /// Ask a transaction to stop. Honored by the next sweep.
    pub fn cancel(&self, id: TransId) -> Result<()> {
        let entry = self.lookup(id)?.ok_or(Error::NotFound(id))?;
        {
            let mut record = entry.lock()?;
            if record.stage.is_terminal() || record.finalized {
                return Err(Error::InvalidState(format!(
                    "trans:{} already {}",
                    id, record.stage
                )));
            }
            if record.cancel_requested || record.stalled {
                return Ok(());
            }
            record.cancel_requested = true;
            tracing::info!(trans_id = id, stage = %record.stage, "cancel requested");
            self.persist_status(&mut record, timestamp_now_millis());
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Turn a pending cancel into a rollback or a stall
    fn handle_cancel(&self, ctx: &StageCtx<'_>, record: &mut TransRecord) {
        match record.stage {
            TransStage::RedoAction if record.policy == TransPolicy::Rollback => {
                record.cancel_requested = false;
                record.set_error(code::CANCELED, "canceled by request");
                if let Err(e) = stage::transition(ctx, record, TransStage::Rollback) {
                    tracing::error!(trans_id = record.id, "cancel rollback failed: {}", e);
                }
            }
            // Not durable yet; decide once the redo log lands.
            TransStage::Created | TransStage::RedoLog
                if record.policy == TransPolicy::Rollback && record.awaiting_ack.is_some() => {}
            TransStage::Rollback | TransStage::UndoAction => {
                record.cancel_requested = false;
            }
            stage if stage.is_terminal() => {
                record.cancel_requested = false;
            }
            stage => {
                record.cancel_requested = false;
                record.stalled = true;
                record.set_error(code::CANCELED, format!("canceled at {}, needs operator", stage));
                tracing::warn!(
                    trans_id = record.id,
                    stage = %stage,
                    policy = %record.policy,
                    "cancel cannot roll back, transaction stalled"
                );
                self.persist_status(record, ctx.now);
                let _ = self.events.send(TransEvent::Stalled {
                    id: record.id,
                    stage,
                });
            }
        }
    }

    /// One pass over every live record: pending cancels, then whatever the
    /// driver finds due. Returns how many records finished.
    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(timestamp_now_millis())
    }

    pub fn sweep_at(&self, now: u64) -> Result<usize> {
        let entries: Vec<(TransId, Entry)> = self
            .trans
            .read()?
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let mut finished = Vec::new();
        for (id, entry) in entries {
            let mut record = entry.lock()?;
            if record.finalized || record.stalled {
                continue;
            }
            if let Err(e) = self.admit(&mut record) {
                tracing::debug!(trans_id = id, "still waiting for resources: {}", e);
                continue;
            }
            if record.status_retry_at > 0 && record.status_retry_at <= now {
                self.persist_status(&mut record, now);
            }
            let ctx = self.ctx(now, false);
            if record.cancel_requested {
                self.handle_cancel(&ctx, &mut record);
                if record.stalled {
                    continue;
                }
            }
            if self.drive_logged(&ctx, &mut record) {
                finished.push(id);
            }
        }

        for id in &finished {
            self.remove(*id);
        }
        Ok(finished.len())
    }

    /// Earliest time any record has sweep work. Records waiting for
    /// resources have none; a release wakes the sweeper instead.
    pub fn next_deadline(&self) -> Option<u64> {
        let trans = self.trans.read().ok()?;
        let earliest = trans
            .values()
            .filter_map(|entry| {
                let record = entry.lock().ok()?;
                if !record.admitted {
                    return None;
                }
                dispatcher::next_deadline(&record, &self.config)
            })
            .min();
        earliest
    }

    /// Snapshot of one record
    pub fn get(&self, id: TransId) -> Result<TransRecord> {
        let entry = self.lookup(id)?.ok_or(Error::NotFound(id))?;
        let record = entry.lock()?;
        Ok(record.clone())
    }

    pub fn list(&self) -> Result<Vec<TransSummary>> {
        let entries: Vec<Entry> = self.trans.read()?.values().cloned().collect();
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            summaries.push(TransSummary::of(&*entry.lock()?));
        }
        summaries.sort_by_key(|s| s.id);
        Ok(summaries)
    }

    /// Operator removal of a stalled record. The durable record is deleted,
    /// resources released and the origin told it was canceled.
    pub fn drop_trans(&self, id: TransId) -> Result<()> {
        let entry = self.lookup(id)?.ok_or(Error::NotFound(id))?;
        {
            let mut record = entry.lock()?;
            if !record.stalled && !record.stage.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "trans:{} is running at {}, cancel it first",
                    id, record.stage
                )));
            }
            if !record.finalized {
                self.store.append_atomic_batch(&LogBatch {
                    trans_id: id,
                    logs: Vec::new(),
                    snapshot: record.encode()?,
                    finalize: true,
                })?;
                self.conflicts.release(id);
                record.finalized = true;

                let mut outcome = stage::outcome_of(&record);
                if outcome.code == code::SUCCESS && !record.stage.is_terminal() {
                    outcome.code = code::CANCELED;
                }
                if let Some(origin) = &record.origin {
                    if let Err(e) = self.transport.notify(origin, &outcome) {
                        tracing::warn!(trans_id = id, origin = %origin, "failed to notify origin: {}", e);
                    }
                }
                let _ = self.events.send(TransEvent::Finished {
                    id,
                    stage: record.stage,
                    code: outcome.code,
                });
            }
            tracing::warn!(trans_id = id, stage = %record.stage, "transaction dropped by operator");
        }
        self.remove(id);
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.trans.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of records currently holding a pending dispatch of `kind`
    pub fn outstanding(&self, kind: ActionKind) -> Vec<TransId> {
        let Ok(trans) = self.trans.read() else {
            return Vec::new();
        };
        let mut ids: Vec<TransId> = trans
            .iter()
            .filter(|(_, entry)| {
                entry
                    .lock()
                    .map(|r| {
                        r.admitted
                            && r.stage.action_kind() == Some(kind)
                            && dispatcher::has_outstanding(&r, kind)
                    })
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Background sweep: sleeps until the earliest deadline (at most
/// `sweep_interval_ms`), or until a new deadline is announced.
pub fn start_sweeper(manager: Arc<TransManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ceiling = manager.config.sweep_interval();
        loop {
            let now = timestamp_now_millis();
            let sleep = match manager.next_deadline() {
                Some(at) => Duration::from_millis(at.saturating_sub(now)).min(ceiling),
                None => ceiling,
            };
            if !sleep.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = manager.wakeup.notified() => {}
                }
            }
            match manager.sweep() {
                Ok(0) => {}
                Ok(finished) => tracing::debug!(finished = finished, "sweep finished transactions"),
                Err(e) => tracing::error!("sweep failed: {}", e),
            }
        }
    })
}

/// Feed transport replies into the manager
pub fn start_response_loop(
    manager: Arc<TransManager>,
    mut replies: mpsc::UnboundedReceiver<ActionResponse>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(rsp) = replies.recv().await {
            if let Err(e) = manager.handle_action_rsp(rsp.handle, rsp.code, rsp.reply) {
                tracing::warn!(trans_id = rsp.handle.trans_id, "reply handling failed: {}", e);
            }
        }
        tracing::info!("reply channel closed, response loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::loopback::LoopbackTransport;
    use crate::store::memory::MemStore;
    use crate::trans::action::{MsgType, TransAction};

    struct Harness {
        store: Arc<MemStore>,
        transport: Arc<LoopbackTransport>,
        manager: TransManager,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemStore::new());
        let transport = Arc::new(LoopbackTransport::new());
        let config = TransConfig {
            max_action_attempts: 3,
            ..Default::default()
        };
        let manager = TransManager::new(config, store.clone(), transport.clone()).unwrap();
        Harness {
            store,
            transport,
            manager,
        }
    }

    fn action(port: u16) -> TransAction {
        TransAction::new(
            Endpoint::new("10.0.0.1", port),
            MsgType::new("create-vnode"),
            Bytes::from_static(b"payload"),
        )
    }

    fn reply_all(h: &Harness, code: i32, now: u64) {
        for sent in h.transport.take_sent() {
            h.manager
                .handle_action_rsp_at(sent.handle, code, Bytes::new(), now)
                .unwrap();
        }
    }

    #[test]
    fn test_ids_follow_store_high_water_mark() {
        let store = Arc::new(MemStore::new());
        store
            .append_atomic_batch(&LogBatch {
                trans_id: 41,
                logs: Vec::new(),
                snapshot: Bytes::new(),
                finalize: true,
            })
            .unwrap();
        let manager =
            TransManager::new(TransConfig::default(), store, Arc::new(LoopbackTransport::new()))
                .unwrap();
        assert_eq!(manager.create(TransPolicy::Retry, None).id, 42);
        assert_eq!(manager.create(TransPolicy::Retry, None).id, 43);
    }

    #[test]
    fn test_prepare_runs_to_finish() {
        let h = harness();
        let mut record = h.manager.create(TransPolicy::Rollback, Some(Endpoint::new("client", 1)));
        record.append_redo_log(Bytes::from_static(b"redo")).unwrap();
        record.append_commit_log(Bytes::from_static(b"commit")).unwrap();
        record.append_redo_action(action(1)).unwrap();
        let id = h.manager.prepare_at(record, 1_000).unwrap();

        assert_eq!(h.manager.get(id).unwrap().stage, TransStage::RedoAction);
        assert!(h.store.contains_log(b"redo"));
        assert!(!h.store.contains_log(b"commit"));

        reply_all(&h, code::SUCCESS, 1_010);
        assert!(h.manager.is_empty());
        assert!(h.store.contains_log(b"commit"));
        assert!(h.store.snapshot(id).is_none());

        let notified = h.transport.notified();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].1.code, code::SUCCESS);
        assert_eq!(notified[0].1.stage, TransStage::Finished);
    }

    #[test]
    fn test_prepare_persist_failure_releases_everything() {
        let h = harness();
        let mut record = h.manager.create(TransPolicy::Rollback, None);
        record.add_resource("db:orders").unwrap();
        record.append_redo_action(action(1)).unwrap();
        h.store.fail_next(1);

        let err = h.manager.prepare_at(record, 1_000).unwrap_err();
        assert!(matches!(err, Error::PersistenceFailure(_)));
        assert!(h.manager.is_empty());
        assert!(h.transport.sent().is_empty());

        let mut retry = h.manager.create(TransPolicy::Rollback, None);
        retry.add_resource("db:orders").unwrap();
        assert!(h.manager.prepare_at(retry, 1_100).is_ok());
    }

    #[test]
    fn test_prepare_twice_rejected() {
        let h = harness();
        let mut record = h.manager.create(TransPolicy::Retry, None);
        record.append_redo_action(action(1)).unwrap();
        let copy = record.clone();
        h.manager.prepare_at(record, 1_000).unwrap();
        assert!(matches!(
            h.manager.prepare_at(copy, 1_000),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_finished_id_cannot_be_prepared_again() {
        let h = harness();
        let mut record = h.manager.create(TransPolicy::Rollback, None);
        record.append_redo_log(Bytes::from_static(b"redo")).unwrap();
        let copy = record.clone();
        let id = h.manager.prepare_at(record, 1_000).unwrap();
        assert!(h.manager.is_empty());
        let batches = h.store.batch_count();

        assert!(matches!(
            h.manager.prepare_at(copy, 1_001),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(h.store.batch_count(), batches);
        assert_eq!(h.store.logs().len(), 1);

        // ids under the store high-water mark are history too
        let stale = TransRecord::new(id - 1, TransPolicy::Retry, None);
        let manager = TransManager::new(
            TransConfig::default(),
            h.store.clone(),
            Arc::new(LoopbackTransport::new()),
        )
        .unwrap();
        assert!(matches!(
            manager.prepare_at(stale, 1_002),
            Err(Error::InvalidState(_))
        ));
        let fresh = manager.create(TransPolicy::Retry, None);
        assert!(manager.prepare_at(fresh, 1_003).is_ok());
    }

    #[test]
    fn test_failed_status_write_retried_by_sweep() {
        let h = harness();
        let mut record = h.manager.create(TransPolicy::Retry, None);
        record.append_redo_action(action(1)).unwrap();
        record.append_redo_action(action(2)).unwrap();
        let id = h.manager.prepare_at(record, 1_000).unwrap();
        let sent = h.transport.take_sent();

        h.store.fail_next(1);
        h.manager
            .handle_action_rsp_at(sent[0].handle, code::SUCCESS, Bytes::new(), 1_001)
            .unwrap();
        let stored = TransRecord::decode(&h.store.snapshot(id).unwrap()).unwrap();
        assert!(!stored.redo_actions[0].is_satisfied());

        let retry_at = h.manager.get(id).unwrap().status_retry_at;
        assert!(retry_at > 1_001);
        assert_eq!(h.manager.next_deadline(), Some(retry_at));

        h.manager.sweep_at(retry_at).unwrap();
        let stored = TransRecord::decode(&h.store.snapshot(id).unwrap()).unwrap();
        assert!(stored.redo_actions[0].is_satisfied());
        assert_eq!(h.manager.get(id).unwrap().status_retry_at, 0);
        // the unanswered action is not due yet
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn test_restored_record_waits_for_held_resource() {
        let h = harness();
        let mut holder = h.manager.create(TransPolicy::Retry, None);
        holder.add_resource("db:x").unwrap();
        holder.append_redo_action(action(1)).unwrap();
        let holder = h.manager.prepare_at(holder, 1_000).unwrap();
        let holder_sent = h.transport.take_sent();

        // a record owned elsewhere, on the same resource
        let mut stored = TransRecord::new(500, TransPolicy::Retry, None);
        stored.add_resource("db:x").unwrap();
        stored.append_redo_action(action(2)).unwrap();
        stored.stage = TransStage::RedoAction;
        let raw = stored.encode().unwrap();
        h.store
            .append_atomic_batch(&LogBatch {
                trans_id: 500,
                logs: Vec::new(),
                snapshot: raw.clone(),
                finalize: false,
            })
            .unwrap();

        h.manager.apply_at(&raw, None, code::SUCCESS, 1_001).unwrap();
        let waiting = h.manager.get(500).unwrap();
        assert!(!waiting.admitted);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.manager.outstanding(ActionKind::Redo), vec![holder]);

        h.manager.sweep_at(1_002).unwrap();
        assert!(h.transport.sent().is_empty());

        h.manager
            .handle_action_rsp_at(holder_sent[0].handle, code::SUCCESS, Bytes::new(), 1_003)
            .unwrap();
        assert!(h.manager.get(holder).is_err());

        h.manager.sweep_at(1_004).unwrap();
        let sent = h.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].handle.trans_id, 500);
        assert!(h.manager.get(500).unwrap().admitted);
    }

    #[test]
    fn test_pending_ack_holds_stage_until_apply() {
        let h = harness();
        h.store.set_deferred_ack(true);
        let mut record = h.manager.create(TransPolicy::Retry, None);
        record.append_redo_log(Bytes::from_static(b"redo")).unwrap();
        record.append_redo_action(action(1)).unwrap();
        let id = h.manager.prepare_at(record, 1_000).unwrap();

        assert_eq!(h.manager.get(id).unwrap().stage, TransStage::RedoLog);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.manager.next_deadline(), None);

        let raw = h.store.snapshot(id).unwrap();
        h.manager.apply_at(&raw, None, code::SUCCESS, 1_005).unwrap();
        assert_eq!(h.manager.get(id).unwrap().stage, TransStage::RedoAction);
        assert_eq!(h.transport.sent().len(), 1);

        // duplicate ack changes nothing
        h.manager.apply_at(&raw, None, code::SUCCESS, 1_006).unwrap();
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[test]
    fn test_rejected_ack_resubmits_after_backoff() {
        let h = harness();
        h.store.set_deferred_ack(true);
        let mut record = h.manager.create(TransPolicy::Retry, None);
        record.append_redo_log(Bytes::from_static(b"redo")).unwrap();
        let id = h.manager.prepare_at(record, 1_000).unwrap();
        let batches = h.store.batch_count();

        let raw = h.store.snapshot(id).unwrap();
        h.manager.apply_at(&raw, None, code::LEADER_CHANGED, 1_001).unwrap();
        let record = h.manager.get(id).unwrap();
        assert_eq!(record.stage, TransStage::RedoLog);
        assert_eq!(record.last_error.unwrap().code, code::PERSISTENCE_FAILURE);

        let at = h.manager.next_deadline().unwrap();
        h.manager.sweep_at(at).unwrap();
        assert_eq!(h.store.batch_count(), batches + 1);
    }

    #[test]
    fn test_apply_adopts_unknown_record() {
        let store = Arc::new(MemStore::new());
        let mut record = TransRecord::new(7, TransPolicy::Retry, None);
        record.append_commit_action(action(3)).unwrap();
        record.stage = TransStage::CommitAction;
        let raw = record.encode().unwrap();
        store
            .append_atomic_batch(&LogBatch {
                trans_id: 7,
                logs: Vec::new(),
                snapshot: raw.clone(),
                finalize: false,
            })
            .unwrap();

        let transport = Arc::new(LoopbackTransport::new());
        let manager =
            TransManager::new(TransConfig::default(), store, transport.clone()).unwrap();
        let origin = Endpoint::new("client", 9);
        manager.apply_at(&raw, Some(origin.clone()), code::SUCCESS, 500).unwrap();

        let adopted = manager.get(7).unwrap();
        assert_eq!(adopted.stage, TransStage::CommitAction);
        assert_eq!(adopted.origin, Some(origin));
        assert_eq!(transport.sent().len(), 1);
        assert!(manager.create(TransPolicy::Retry, None).id > 7);
    }

    #[test]
    fn test_cancel_before_commit_rolls_back() {
        let h = harness();
        let mut record = h.manager.create(TransPolicy::Rollback, None);
        record.append_redo_action(action(1)).unwrap();
        record.append_undo_action(action(2)).unwrap();
        record.append_commit_log(Bytes::from_static(b"commit")).unwrap();
        let id = h.manager.prepare_at(record, 1_000).unwrap();
        h.transport.take_sent();

        h.manager.cancel(id).unwrap();
        assert_eq!(h.manager.next_deadline(), Some(0));
        h.manager.sweep_at(1_001).unwrap();

        let record = h.manager.get(id).unwrap();
        assert_eq!(record.stage, TransStage::UndoAction);
        assert!(!record.cancel_requested);
        reply_all(&h, code::SUCCESS, 1_002);

        assert!(h.manager.is_empty());
        assert!(!h.store.contains_log(b"commit"));
    }

    #[test]
    fn test_cancel_retry_policy_stalls_until_dropped() {
        let h = harness();
        let mut events = h.manager.subscribe();
        let mut record = h.manager.create(TransPolicy::Retry, Some(Endpoint::new("client", 1)));
        record.add_resource("vgroup:3").unwrap();
        record.append_redo_action(action(1)).unwrap();
        let id = h.manager.prepare_at(record, 1_000).unwrap();
        h.transport.take_sent();

        assert!(matches!(h.manager.drop_trans(id), Err(Error::InvalidState(_))));
        h.manager.cancel(id).unwrap();
        h.manager.sweep_at(1_001).unwrap();

        let record = h.manager.get(id).unwrap();
        assert!(record.stalled);
        assert_eq!(record.last_error.as_ref().unwrap().code, code::CANCELED);
        assert_eq!(h.manager.next_deadline(), None);

        // stalled records dispatch nothing
        h.manager.sweep_at(100_000).unwrap();
        assert!(h.transport.sent().is_empty());

        h.manager.drop_trans(id).unwrap();
        assert!(h.manager.is_empty());
        assert!(h.store.snapshot(id).is_none());
        assert_eq!(h.transport.notified()[0].1.code, code::CANCELED);

        let mut saw_stall = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransEvent::Stalled { id: sid, .. } if sid == id) {
                saw_stall = true;
            }
        }
        assert!(saw_stall);

        let mut next = h.manager.create(TransPolicy::Retry, None);
        next.add_resource("vgroup:3").unwrap();
        assert!(h.manager.prepare_at(next, 100_001).is_ok());
    }

    #[test]
    fn test_cancel_unknown_is_not_found() {
        let h = harness();
        assert!(matches!(h.manager.cancel(99), Err(Error::NotFound(99))));
        assert!(matches!(h.manager.get(99), Err(Error::NotFound(99))));
    }

    #[test]
    fn test_cleanup_releases_and_init_resumes() {
        let h = harness();
        let mut record = h.manager.create(TransPolicy::Retry, None);
        record.add_resource("db:users").unwrap();
        record.append_redo_action(action(1)).unwrap();
        record.append_redo_action(action(2)).unwrap();
        let id = h.manager.prepare_at(record, 1_000).unwrap();
        let sent = h.transport.take_sent();
        h.manager
            .handle_action_rsp_at(sent[0].handle, code::SUCCESS, Bytes::new(), 1_001)
            .unwrap();

        h.manager.cleanup_trans().unwrap();
        assert!(h.manager.is_empty());
        assert!(h.store.snapshot(id).is_some());

        assert_eq!(h.manager.init_trans_at(2_000).unwrap(), 1);
        let record = h.manager.get(id).unwrap();
        assert_eq!(record.stage, TransStage::RedoAction);
        assert!(record.redo_actions[0].is_satisfied());

        // only the unanswered action goes out again
        let resent = h.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].handle.index, 1);
    }

    #[test]
    fn test_list_and_outstanding() {
        let h = harness();
        let mut a = h.manager.create(TransPolicy::Retry, None);
        a.set_name("create-db").unwrap();
        a.append_redo_action(action(1)).unwrap();
        let a = h.manager.prepare_at(a, 1_000).unwrap();
        let mut b = h.manager.create(TransPolicy::Rollback, None);
        b.set_name("drop-db").unwrap();
        let b = h.manager.prepare_at(b, 1_000).unwrap();

        let list = h.manager.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, a);
        assert_eq!(list[0].name, "create-db");
        assert_eq!(list[0].pending_actions, 1);
        assert!(h.manager.get(b).is_err());
        assert_eq!(h.manager.outstanding(ActionKind::Redo), vec![a]);
    }
}
