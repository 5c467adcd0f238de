//! Stage state machine
//!
//! ```text
//! CREATED → REDO_LOG → REDO_ACTION → COMMIT_LOG → COMMIT_ACTION → FINISHED
//!                          │
//!                          └──→ ROLLBACK → UNDO_ACTION → ROLLBACK_FINISHED
//! ```
//!
//! Each stage has one handler in [`handler_for`]. A handler either advances
//! the record to its next stage, asks the driver to wait (outstanding
//! actions, unacknowledged store write, backoff), or reports that the record
//! is finalized.

use crate::common::{backoff_delay_ms, Error, Result, TransConfig};
use crate::rpc::{TransOutcome, Transport};
use crate::store::{LogBatch, MetaStore, StoreAck};
use crate::trans::action::ActionKind;
use crate::trans::code;
use crate::trans::conflict::AdmissionTable;
use crate::trans::dispatcher::{self, ActionProgress};
use crate::trans::record::{TransId, TransPolicy, TransRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransStage {
    Created,
    RedoLog,
    RedoAction,
    CommitLog,
    CommitAction,
    Finished,
    Rollback,
    UndoAction,
    RollbackFinished,
}

impl TransStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransStage::Created => "created",
            TransStage::RedoLog => "redo-log",
            TransStage::RedoAction => "redo-action",
            TransStage::CommitLog => "commit-log",
            TransStage::CommitAction => "commit-action",
            TransStage::Finished => "finished",
            TransStage::Rollback => "rollback",
            TransStage::UndoAction => "undo-action",
            TransStage::RollbackFinished => "rollback-finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransStage::Finished | TransStage::RollbackFinished)
    }

    /// Legal edges of the stage graph
    pub fn can_advance_to(&self, next: TransStage) -> bool {
        use TransStage::*;
        matches!(
            (self, next),
            (Created, RedoLog)
                | (RedoLog, RedoAction)
                | (RedoAction, CommitLog)
                | (RedoAction, Rollback)
                | (CommitLog, CommitAction)
                | (CommitAction, Finished)
                | (Rollback, UndoAction)
                | (UndoAction, RollbackFinished)
        )
    }

    /// Action list dispatched while in this stage
    pub fn action_kind(&self) -> Option<ActionKind> {
        match self {
            TransStage::RedoAction => Some(ActionKind::Redo),
            TransStage::CommitAction => Some(ActionKind::Commit),
            TransStage::UndoAction => Some(ActionKind::Undo),
            _ => None,
        }
    }

    /// True once the commit log may have been written
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            TransStage::CommitLog | TransStage::CommitAction | TransStage::Finished
        )
    }
}

impl fmt::Display for TransStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransEvent {
    StageChanged {
        id: TransId,
        from: TransStage,
        to: TransStage,
    },
    Stalled {
        id: TransId,
        stage: TransStage,
    },
    Finished {
        id: TransId,
        stage: TransStage,
        code: i32,
    },
}

/// Collaborators a handler may touch, passed by reference on every call
pub struct StageCtx<'a> {
    pub store: &'a dyn MetaStore,
    pub transport: &'a dyn Transport,
    pub conflicts: &'a dyn AdmissionTable,
    pub config: &'a TransConfig,
    pub events: &'a broadcast::Sender<TransEvent>,
    pub now: u64,
    /// Surface a failed redo log write to the caller instead of scheduling a
    /// retry. Set only by `prepare`, before anything is durable.
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Advance(TransStage),
    Wait,
    Done,
}

pub type StageHandler = fn(&StageCtx<'_>, &mut TransRecord) -> Result<StageOutcome>;

pub fn handler_for(stage: TransStage) -> StageHandler {
    match stage {
        TransStage::Created => on_created,
        TransStage::RedoLog => on_redo_log,
        TransStage::RedoAction => on_redo_action,
        TransStage::CommitLog => on_commit_log,
        TransStage::CommitAction => on_commit_action,
        TransStage::Rollback => on_rollback,
        TransStage::UndoAction => on_undo_action,
        TransStage::Finished | TransStage::RollbackFinished => on_terminal,
    }
}

/// Move `record` along one legal edge
pub fn transition(ctx: &StageCtx<'_>, record: &mut TransRecord, next: TransStage) -> Result<()> {
    let from = record.stage;
    if !from.can_advance_to(next) {
        return Err(Error::InvalidState(format!(
            "trans:{} illegal stage change {} -> {}",
            record.id, from, next
        )));
    }
    record.stage = next;
    record.last_exec_at = ctx.now;
    if next == TransStage::CommitAction {
        record.last_error = None;
    }
    tracing::info!(trans_id = record.id, from = %from, to = %next, "stage changed");
    let _ = ctx.events.send(TransEvent::StageChanged {
        id: record.id,
        from,
        to: next,
    });
    Ok(())
}

/// Run handlers until the record has to wait or is finalized
pub fn drive(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    loop {
        if record.finalized {
            return Ok(StageOutcome::Done);
        }
        if record.awaiting_ack.is_some() || record.stalled {
            return Ok(StageOutcome::Wait);
        }
        match handler_for(record.stage)(ctx, record)? {
            StageOutcome::Advance(next) => transition(ctx, record, next)?,
            other => return Ok(other),
        }
    }
}

fn on_created(_ctx: &StageCtx<'_>, _record: &mut TransRecord) -> Result<StageOutcome> {
    Ok(StageOutcome::Advance(TransStage::RedoLog))
}

fn on_redo_log(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    let logs = record.redo_logs.clone();
    persist_logs(ctx, record, logs, TransStage::RedoAction)
}

fn on_commit_log(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    let logs = record.commit_logs.clone();
    persist_logs(ctx, record, logs, TransStage::CommitAction)
}

fn on_rollback(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    let logs = record.undo_logs.clone();
    persist_logs(ctx, record, logs, TransStage::UndoAction)
}

/// Write `logs` together with the record snapshot at `next` as one batch
fn persist_logs(
    ctx: &StageCtx<'_>,
    record: &mut TransRecord,
    logs: Vec<bytes::Bytes>,
    next: TransStage,
) -> Result<StageOutcome> {
    if record.persist_retry_at > ctx.now {
        return Ok(StageOutcome::Wait);
    }

    let batch = LogBatch {
        trans_id: record.id,
        logs,
        snapshot: snapshot_at(ctx, record, next)?,
        finalize: false,
    };

    match ctx.store.append_atomic_batch(&batch) {
        Ok(StoreAck::Committed) => {
            record.persist_retry_at = 0;
            record.status_retry_at = 0;
            Ok(StageOutcome::Advance(next))
        }
        Ok(StoreAck::Pending) => {
            tracing::debug!(trans_id = record.id, stage = %record.stage, "log batch awaiting replication");
            record.awaiting_ack = Some(next);
            Ok(StageOutcome::Wait)
        }
        Err(e) => {
            if ctx.fail_fast && record.stage == TransStage::RedoLog {
                return Err(Error::PersistenceFailure(e.to_string()));
            }
            schedule_persist_retry(ctx, record, &e.to_string());
            Ok(StageOutcome::Wait)
        }
    }
}

/// Encode the record as it will look once `next` is entered
fn snapshot_at(ctx: &StageCtx<'_>, record: &TransRecord, next: TransStage) -> Result<bytes::Bytes> {
    let mut snapshot = record.clone();
    snapshot.stage = next;
    snapshot.last_exec_at = ctx.now;
    if next == TransStage::CommitAction {
        snapshot.last_error = None;
    }
    snapshot.encode()
}

/// Record a failed log write and arm the next attempt
pub fn schedule_persist_retry(ctx: &StageCtx<'_>, record: &mut TransRecord, reason: &str) {
    record.failed_times += 1;
    record.persist_retry_at = ctx.now
        + backoff_delay_ms(
            record.failed_times,
            ctx.config.retry_backoff_ms,
            ctx.config.retry_backoff_max_ms,
        );
    record.set_error(code::PERSISTENCE_FAILURE, reason);
    if record.stage == TransStage::CommitLog {
        tracing::error!(
            trans_id = record.id,
            failed_times = record.failed_times,
            "commit log write failed, operation is blocked until the store recovers: {}",
            reason
        );
    } else {
        tracing::warn!(
            trans_id = record.id,
            stage = %record.stage,
            failed_times = record.failed_times,
            "log write failed: {}",
            reason
        );
    }
}

fn on_redo_action(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    match dispatcher::drive_actions(ctx, record, ActionKind::Redo)? {
        ActionProgress::AllSatisfied => Ok(StageOutcome::Advance(TransStage::CommitLog)),
        ActionProgress::Outstanding => Ok(StageOutcome::Wait),
        ActionProgress::Failed { index, code } => match record.policy {
            TransPolicy::Rollback => {
                record.set_error(
                    code,
                    format!("redo action {} failed: {}", index, code::code_str(code)),
                );
                tracing::warn!(
                    trans_id = record.id,
                    action = index,
                    code = code,
                    "redo action failed, rolling back"
                );
                Ok(StageOutcome::Advance(TransStage::Rollback))
            }
            TransPolicy::Retry => {
                dispatcher::rearm_failed(ctx, record, ActionKind::Redo);
                Ok(StageOutcome::Wait)
            }
        },
    }
}

fn on_commit_action(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    match dispatcher::drive_actions(ctx, record, ActionKind::Commit)? {
        ActionProgress::AllSatisfied => Ok(StageOutcome::Advance(TransStage::Finished)),
        ActionProgress::Outstanding => Ok(StageOutcome::Wait),
        ActionProgress::Failed { .. } => {
            // Committed already; finish once nothing is outstanding and report the damage.
            if dispatcher::has_outstanding(record, ActionKind::Commit) {
                return Ok(StageOutcome::Wait);
            }
            let failed: Vec<String> = record
                .commit_actions
                .iter()
                .enumerate()
                .filter(|(_, a)| a.is_failed())
                .map(|(i, a)| format!("#{} {}", i, code::code_str(a.err_code)))
                .collect();
            let code = record
                .commit_actions
                .iter()
                .find(|a| a.is_failed())
                .map(|a| a.err_code)
                .unwrap_or(code::INTERNAL);
            record.set_error(code, format!("commit actions failed: {}", failed.join(", ")));
            tracing::error!(
                trans_id = record.id,
                failed = %failed.join(", "),
                "commit actions failed after commit, finishing degraded"
            );
            Ok(StageOutcome::Advance(TransStage::Finished))
        }
    }
}

fn on_undo_action(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    match dispatcher::drive_actions(ctx, record, ActionKind::Undo)? {
        ActionProgress::AllSatisfied => Ok(StageOutcome::Advance(TransStage::RollbackFinished)),
        ActionProgress::Outstanding => Ok(StageOutcome::Wait),
        ActionProgress::Failed { .. } => {
            dispatcher::rearm_failed(ctx, record, ActionKind::Undo);
            Ok(StageOutcome::Wait)
        }
    }
}

/// Finalize: drop the durable record, release resources, tell the origin
fn on_terminal(ctx: &StageCtx<'_>, record: &mut TransRecord) -> Result<StageOutcome> {
    if record.persist_retry_at > ctx.now {
        return Ok(StageOutcome::Wait);
    }
    let batch = LogBatch {
        trans_id: record.id,
        logs: Vec::new(),
        snapshot: record.encode()?,
        finalize: true,
    };
    if let Err(e) = ctx.store.append_atomic_batch(&batch) {
        // Keep last_error untouched: it is the outcome reported to the origin.
        record.failed_times += 1;
        record.persist_retry_at = ctx.now
            + backoff_delay_ms(
                record.failed_times,
                ctx.config.retry_backoff_ms,
                ctx.config.retry_backoff_max_ms,
            );
        tracing::warn!(trans_id = record.id, stage = %record.stage, "finalize write failed: {}", e);
        return Ok(StageOutcome::Wait);
    }

    ctx.conflicts.release(record.id);
    record.finalized = true;

    let outcome = outcome_of(record);
    if outcome.code == code::SUCCESS {
        tracing::info!(trans_id = record.id, name = %record.name, stage = %record.stage, "transaction finished");
    } else {
        tracing::warn!(
            trans_id = record.id,
            name = %record.name,
            stage = %record.stage,
            code = outcome.code,
            "transaction finished with failure: {}",
            outcome.message
        );
    }

    if let Some(origin) = &record.origin {
        if let Err(e) = ctx.transport.notify(origin, &outcome) {
            tracing::warn!(trans_id = record.id, origin = %origin, "failed to notify origin: {}", e);
        }
    }
    let _ = ctx.events.send(TransEvent::Finished {
        id: record.id,
        stage: record.stage,
        code: outcome.code,
    });
    Ok(StageOutcome::Done)
}

/// Final result reported to the origin
pub fn outcome_of(record: &TransRecord) -> TransOutcome {
    let (code, message) = match (record.stage, &record.last_error) {
        (TransStage::Finished, None) => (code::SUCCESS, "ok".to_string()),
        (TransStage::RollbackFinished, None) => (code::INTERNAL, "rolled back".to_string()),
        // A finished record only keeps an error if commit actions failed;
        // earlier errors are cleared when the commit log lands.
        (_, Some(err)) => (err.code, err.message.clone()),
        (_, None) => (code::INTERNAL, format!("ended at {}", record.stage)),
    };
    TransOutcome {
        trans_id: record.id,
        name: record.name.clone(),
        stage: record.stage,
        code,
        message,
    }
}

/// Diagnostics: stage name
pub fn stage_str(stage: TransStage) -> &'static str {
    stage.as_str()
}

/// Diagnostics: policy name
pub fn policy_str(policy: TransPolicy) -> &'static str {
    policy.as_str()
}
