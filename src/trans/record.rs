//! Transaction record: identity, policy, stage, logs and action lists
//!
//! A record is built single-handedly by its creator (appends), then handed to
//! [`TransManager::prepare`](crate::trans::TransManager::prepare). From then on
//! list membership is frozen and only action status fields change.
//!
//! Snapshot format: `[MAGIC][VERSION][BODY_LEN][BODY][CRC32]`, body encoded
//! with bincode.

use crate::common::{crc32, timestamp_now_millis, Error, Result};
use crate::trans::action::{ActionKind, Endpoint, TransAction};
use crate::trans::stage::TransStage;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

const SNAPSHOT_MAGIC: [u8; 4] = *b"TRN1";
const SNAPSHOT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4;

pub type TransId = u64;

/// What happens when a step fails irrecoverably
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransPolicy {
    Rollback,
    Retry,
}

impl TransPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransPolicy::Rollback => "rollback",
            TransPolicy::Retry => "retry",
        }
    }
}

impl fmt::Display for TransPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransRecord {
    pub id: TransId,
    pub name: String,
    pub policy: TransPolicy,
    pub stage: TransStage,
    pub resources: Vec<String>,
    pub redo_logs: Vec<Bytes>,
    pub undo_logs: Vec<Bytes>,
    pub commit_logs: Vec<Bytes>,
    pub redo_actions: Vec<TransAction>,
    pub undo_actions: Vec<TransAction>,
    pub commit_actions: Vec<TransAction>,
    pub created_at: u64,
    pub last_exec_at: u64,
    pub origin: Option<Endpoint>,
    pub cancel_requested: bool,
    /// Parked after a cancel that could not roll back; needs an operator
    pub stalled: bool,
    pub failed_times: u32,
    pub last_error: Option<LastError>,

    /// Post-write stage of a batch the store has not acknowledged yet
    #[serde(skip)]
    pub awaiting_ack: Option<TransStage>,
    /// Earliest time a failed log write is submitted again
    #[serde(skip)]
    pub persist_retry_at: u64,
    /// Set when a status snapshot write failed: when to write it again
    #[serde(skip)]
    pub status_retry_at: u64,
    /// Holds its resources in the admission table
    #[serde(skip)]
    pub admitted: bool,
    #[serde(skip)]
    pub finalized: bool,
}

impl TransRecord {
    pub fn new(id: TransId, policy: TransPolicy, origin: Option<Endpoint>) -> Self {
        let now = timestamp_now_millis();
        Self {
            id,
            name: String::new(),
            policy,
            stage: TransStage::Created,
            resources: Vec::new(),
            redo_logs: Vec::new(),
            undo_logs: Vec::new(),
            commit_logs: Vec::new(),
            redo_actions: Vec::new(),
            undo_actions: Vec::new(),
            commit_actions: Vec::new(),
            created_at: now,
            last_exec_at: now,
            origin,
            cancel_requested: false,
            stalled: false,
            failed_times: 0,
            last_error: None,
            awaiting_ack: None,
            persist_retry_at: 0,
            status_retry_at: 0,
            admitted: false,
            finalized: false,
        }
    }

    fn ensure_building(&self) -> Result<()> {
        if self.stage != TransStage::Created {
            return Err(Error::InvalidState(format!(
                "trans:{} already prepared (stage {})",
                self.id, self.stage
            )));
        }
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_building()?;
        self.name = name.into();
        Ok(())
    }

    /// Declare a resource this transaction must hold exclusively
    pub fn add_resource(&mut self, resource: impl Into<String>) -> Result<()> {
        self.ensure_building()?;
        let resource = resource.into();
        crate::common::utils::validate_resource(&resource)?;
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
        Ok(())
    }

    pub fn append_redo_log(&mut self, raw: impl Into<Bytes>) -> Result<()> {
        self.ensure_building()?;
        self.redo_logs.push(raw.into());
        Ok(())
    }

    pub fn append_undo_log(&mut self, raw: impl Into<Bytes>) -> Result<()> {
        self.ensure_building()?;
        self.undo_logs.push(raw.into());
        Ok(())
    }

    pub fn append_commit_log(&mut self, raw: impl Into<Bytes>) -> Result<()> {
        self.ensure_building()?;
        self.commit_logs.push(raw.into());
        Ok(())
    }

    pub fn append_redo_action(&mut self, action: TransAction) -> Result<()> {
        self.ensure_building()?;
        self.redo_actions.push(action);
        Ok(())
    }

    pub fn append_undo_action(&mut self, action: TransAction) -> Result<()> {
        self.ensure_building()?;
        self.undo_actions.push(action);
        Ok(())
    }

    pub fn append_commit_action(&mut self, action: TransAction) -> Result<()> {
        self.ensure_building()?;
        self.commit_actions.push(action);
        Ok(())
    }

    pub fn actions(&self, kind: ActionKind) -> &[TransAction] {
        match kind {
            ActionKind::Redo => &self.redo_actions,
            ActionKind::Undo => &self.undo_actions,
            ActionKind::Commit => &self.commit_actions,
        }
    }

    pub fn actions_mut(&mut self, kind: ActionKind) -> &mut Vec<TransAction> {
        match kind {
            ActionKind::Redo => &mut self.redo_actions,
            ActionKind::Undo => &mut self.undo_actions,
            ActionKind::Commit => &mut self.commit_actions,
        }
    }

    pub fn set_error(&mut self, code: i32, message: impl Into<String>) {
        self.last_error = Some(LastError {
            code,
            message: message.into(),
        });
    }

    /// Forget every in-flight send. Used after a restart, when replies to
    /// sends made by the previous process can no longer arrive.
    pub fn reset_in_flight(&mut self) {
        for kind in [ActionKind::Redo, ActionKind::Undo, ActionKind::Commit] {
            for action in self.actions_mut(kind) {
                action.reset_in_flight();
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let body = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len() + 4);
        buf.put_slice(&SNAPSHOT_MAGIC);
        buf.put_u8(SNAPSHOT_VERSION);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        buf.put_u32_le(crc32(&body));
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN + 4 {
            return Err(Error::Corrupted(format!(
                "trans snapshot too short: {} bytes",
                raw.len()
            )));
        }
        if raw[..4] != SNAPSHOT_MAGIC {
            return Err(Error::Corrupted("bad trans snapshot magic".into()));
        }
        if raw[4] != SNAPSHOT_VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported trans snapshot version {}",
                raw[4]
            )));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&raw[5..9]);
        let body_len = u32::from_le_bytes(len_bytes) as usize;
        if raw.len() != HEADER_LEN + body_len + 4 {
            return Err(Error::Corrupted(format!(
                "trans snapshot length mismatch: header says {}, have {}",
                body_len,
                raw.len() - HEADER_LEN - 4
            )));
        }

        let body = &raw[HEADER_LEN..HEADER_LEN + body_len];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&raw[HEADER_LEN + body_len..]);
        let expected = u32::from_le_bytes(crc_bytes);
        let actual = crc32(body);
        if expected != actual {
            return Err(Error::Corrupted(format!(
                "trans snapshot checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }

        Ok(bincode::deserialize(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trans::action::MsgType;

    fn sample() -> TransRecord {
        let mut record = TransRecord::new(42, TransPolicy::Rollback, None);
        record.set_name("create-db").unwrap();
        record.add_resource("db1").unwrap();
        record.append_redo_log(&b"db1:creating"[..]).unwrap();
        record.append_undo_log(&b"db1:dropped"[..]).unwrap();
        record.append_commit_log(&b"db1:ready"[..]).unwrap();
        record
            .append_redo_action(TransAction::new(
                Endpoint::new("dnode-1", 6030),
                MsgType::new("create-vnode"),
                &b"vg2"[..],
            ))
            .unwrap();
        record
    }

    #[test]
    fn test_append_after_prepare_is_rejected() {
        let mut record = sample();
        record.stage = TransStage::RedoAction;

        let err = record.append_redo_log(&b"late"[..]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(record.redo_logs.len(), 1);

        let action = record.redo_actions[0].clone();
        assert!(record.append_undo_action(action).is_err());
        assert!(record.undo_actions.is_empty());
        assert!(record.add_resource("db2").is_err());
        assert_eq!(record.resources, vec!["db1".to_string()]);
    }

    #[test]
    fn test_duplicate_resource_kept_once() {
        let mut record = sample();
        record.add_resource("db1").unwrap();
        assert_eq!(record.resources.len(), 1);
    }

    #[test]
    fn test_snapshot_keeps_stage_and_status() {
        let mut record = sample();
        record.stage = TransStage::RedoAction;
        record.redo_actions[0].sent = true;
        record.redo_actions[0].received = true;
        record.redo_actions[0].attempts = 2;
        record.awaiting_ack = Some(TransStage::CommitAction);

        let decoded = TransRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.stage, TransStage::RedoAction);
        assert_eq!(decoded.redo_actions, record.redo_actions);
        assert_eq!(decoded.commit_logs, record.commit_logs);
        assert_eq!(decoded.awaiting_ack, None);
    }

    #[test]
    fn test_decode_rejects_damage() {
        let raw = sample().encode().unwrap();

        let mut flipped = raw.to_vec();
        let last = flipped.len() - 5;
        flipped[last] ^= 0xFF;
        assert!(matches!(
            TransRecord::decode(&flipped),
            Err(Error::Corrupted(_))
        ));

        assert!(TransRecord::decode(&raw[..raw.len() - 1]).is_err());
        assert!(TransRecord::decode(b"nope").is_err());
    }
}
