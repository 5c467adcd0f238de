//! Action dispatcher
//!
//! Sends the current stage's actions, folds replies back into action status
//! and decides what is due for a re-send. All functions here operate on a
//! record the caller already holds the lock for; none of them block on the
//! network.

use crate::common::{backoff_delay_ms, Result, TransConfig};
use crate::rpc::RequestHandle;
use crate::trans::action::{ActionKind, TransAction};
use crate::trans::code::{self, RspClass};
use crate::trans::record::{TransId, TransPolicy, TransRecord};
use crate::trans::stage::StageCtx;

/// Completion state of one action list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionProgress {
    AllSatisfied,
    Outstanding,
    Failed { index: usize, code: i32 },
}

/// What a reply did to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyEffect {
    Updated,
    Stale,
}

/// Whether retries of `kind` are capped by `max_action_attempts`
pub fn is_bounded(policy: TransPolicy, kind: ActionKind) -> bool {
    match kind {
        ActionKind::Commit => true,
        ActionKind::Redo => policy == TransPolicy::Rollback,
        ActionKind::Undo => false,
    }
}

/// Send what is due, then report progress of the list
pub fn drive_actions(
    ctx: &StageCtx<'_>,
    record: &mut TransRecord,
    kind: ActionKind,
) -> Result<ActionProgress> {
    let sent = dispatch_due(ctx, record, kind);
    if sent > 0 {
        tracing::debug!(trans_id = record.id, kind = %kind, sent = sent, "actions dispatched");
    }
    Ok(progress(record.actions(kind)))
}

pub fn progress(actions: &[TransAction]) -> ActionProgress {
    if let Some((index, action)) = actions.iter().enumerate().find(|(_, a)| a.is_failed()) {
        return ActionProgress::Failed {
            index,
            code: action.err_code,
        };
    }
    if actions.iter().all(|a| a.is_satisfied()) {
        ActionProgress::AllSatisfied
    } else {
        ActionProgress::Outstanding
    }
}

/// Anything in the list still waiting for a reply or a re-send
pub fn has_outstanding(record: &TransRecord, kind: ActionKind) -> bool {
    record.actions(kind).iter().any(|a| !a.received)
}

fn due_at(action: &TransAction, config: &TransConfig) -> Option<u64> {
    if action.received {
        None
    } else if !action.sent || action.retry_at > 0 {
        Some(action.retry_at)
    } else {
        Some(action.last_sent_at + config.response_timeout_ms)
    }
}

/// Send every action of `kind` whose deadline has passed. Returns how many
/// went out.
pub fn dispatch_due(ctx: &StageCtx<'_>, record: &mut TransRecord, kind: ActionKind) -> usize {
    let trans_id = record.id;
    let bounded = is_bounded(record.policy, kind);
    let mut sent = 0;

    for (index, action) in record.actions_mut(kind).iter_mut().enumerate() {
        match due_at(action, ctx.config) {
            Some(at) if at <= ctx.now => {}
            _ => continue,
        }

        if bounded && action.attempts >= ctx.config.max_action_attempts {
            tracing::warn!(
                trans_id = trans_id,
                kind = %kind,
                action = index,
                attempts = action.attempts,
                last_code = action.err_code,
                "action gave up after max attempts"
            );
            action.received = true;
            action.err_code = code::ACTION_EXHAUSTED;
            continue;
        }

        send_action(ctx, trans_id, kind, index, action);
        sent += 1;
    }
    sent
}

fn send_action(
    ctx: &StageCtx<'_>,
    trans_id: TransId,
    kind: ActionKind,
    index: usize,
    action: &mut TransAction,
) {
    action.attempts += 1;
    action.epoch = action.epoch.wrapping_add(1);
    action.sent = true;
    action.received = false;
    action.last_sent_at = ctx.now;
    action.retry_at = 0;

    let handle = RequestHandle {
        trans_id,
        kind,
        index: index as u32,
        epoch: action.epoch,
    };

    let transport = ctx.transport;
    let endpoint = action.ep_set.select_live(|ep| transport.is_live(ep)).cloned();
    let result = match &endpoint {
        Some(ep) => transport.send_async(ep, &action.msg_type, action.payload.clone(), handle),
        None => Err(crate::Error::Transport("no live endpoint".into())),
    };

    match result {
        Ok(()) => {
            tracing::debug!(
                trans_id = trans_id,
                kind = %kind,
                action = index,
                msg_type = %action.msg_type,
                attempt = action.attempts,
                endpoint = ?endpoint.as_ref().map(|e| e.to_string()),
                "action sent"
            );
        }
        Err(e) if e.is_retryable() => {
            action.err_code = code::NETWORK_UNAVAILABLE;
            action.retry_at = ctx.now + backoff(ctx.config, action.attempts);
            tracing::warn!(
                trans_id = trans_id,
                kind = %kind,
                action = index,
                attempt = action.attempts,
                "action send failed: {}",
                e
            );
        }
        Err(e) => {
            // Settled like a fatal reply
            action.received = true;
            action.err_code = e.code();
            tracing::error!(
                trans_id = trans_id,
                kind = %kind,
                action = index,
                code = action.err_code,
                "action rejected by transport: {}",
                e
            );
        }
    }
}

fn backoff(config: &TransConfig, attempts: u32) -> u64 {
    backoff_delay_ms(attempts, config.retry_backoff_ms, config.retry_backoff_max_ms)
}

/// Fold one reply into the record. Replies for another stage, another list,
/// an older send or an already settled action are stale and change nothing.
pub fn apply_reply(
    record: &mut TransRecord,
    handle: &RequestHandle,
    code: i32,
    now: u64,
    config: &TransConfig,
) -> ReplyEffect {
    let Some(kind) = record.stage.action_kind() else {
        return ReplyEffect::Stale;
    };
    if kind != handle.kind {
        return ReplyEffect::Stale;
    }
    let trans_id = record.id;
    let Some(action) = record.actions_mut(kind).get_mut(handle.index as usize) else {
        return ReplyEffect::Stale;
    };
    if action.epoch != handle.epoch || !action.sent || action.received {
        return ReplyEffect::Stale;
    }

    match code::classify(code) {
        RspClass::Success => {
            action.received = true;
            action.err_code = code::SUCCESS;
        }
        RspClass::Redirect => {
            action.ep_set.advance();
            action.sent = false;
            action.err_code = code;
            action.retry_at = 0;
            tracing::debug!(
                trans_id = trans_id,
                kind = %kind,
                action = handle.index,
                next = ?action.ep_set.current().map(|e| e.to_string()),
                "action redirected"
            );
        }
        RspClass::Transient => {
            action.err_code = code;
            action.retry_at = now + backoff(config, action.attempts);
            tracing::debug!(
                trans_id = trans_id,
                kind = %kind,
                action = handle.index,
                code = %code::code_str(code),
                retry_in_ms = action.retry_at - now,
                "action transient failure"
            );
        }
        RspClass::Fatal => {
            action.received = true;
            action.err_code = code;
        }
    }
    ReplyEffect::Updated
}

/// Put failed actions back in the queue behind a backoff. Used where the
/// policy says to keep trying (RETRY redo actions, undo actions).
pub fn rearm_failed(ctx: &StageCtx<'_>, record: &mut TransRecord, kind: ActionKind) {
    let trans_id = record.id;
    let mut rearmed = Vec::new();
    for (index, action) in record.actions_mut(kind).iter_mut().enumerate() {
        if action.is_failed() {
            rearmed.push((index, action.err_code));
            action.received = false;
            action.sent = false;
            action.retry_at = ctx.now + backoff(ctx.config, action.attempts);
        }
    }
    if let Some(&(index, code)) = rearmed.first() {
        record.failed_times += 1;
        record.set_error(
            code,
            format!("{} action {} failed: {}", kind, index, code::code_str(code)),
        );
        tracing::warn!(
            trans_id = trans_id,
            kind = %kind,
            failed = rearmed.len(),
            failed_times = record.failed_times,
            "actions failed, retrying"
        );
    }
}

/// Earliest time the sweep has work for this record
pub fn next_deadline(record: &TransRecord, config: &TransConfig) -> Option<u64> {
    if record.finalized || record.stalled || record.awaiting_ack.is_some() {
        return None;
    }
    if record.cancel_requested {
        return Some(0);
    }
    match record.stage.action_kind() {
        Some(kind) => {
            let status = (record.status_retry_at > 0).then_some(record.status_retry_at);
            record
                .actions(kind)
                .iter()
                .filter_map(|a| due_at(a, config))
                .chain(status)
                .min()
        }
        None => Some(record.persist_retry_at),
    }
}
