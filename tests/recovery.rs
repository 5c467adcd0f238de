//! Recovery tests for minitrans: crash and restart on a RocksDB store

use bytes::Bytes;
use minitrans::common::TransConfig;
use minitrans::rpc::LoopbackTransport;
use minitrans::store::{MetaStore, RocksStore};
use minitrans::trans::code;
use minitrans::trans::{
    ActionKind, Endpoint, MsgType, TransAction, TransManager, TransPolicy, TransRecord, TransStage,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open(path: &Path) -> (Arc<RocksStore>, Arc<LoopbackTransport>, TransManager) {
    let store = Arc::new(RocksStore::open(path).unwrap());
    let transport = Arc::new(LoopbackTransport::new());
    let manager =
        TransManager::new(TransConfig::default(), store.clone(), transport.clone()).unwrap();
    (store, transport, manager)
}

fn action(port: u16, msg: &str) -> TransAction {
    TransAction::new(
        Endpoint::new("dnode", port),
        MsgType::new(msg),
        Bytes::from(format!("{}@{}", msg, port)),
    )
}

fn status(record: &TransRecord, kind: ActionKind) -> Vec<(bool, bool, i32, u32)> {
    record
        .actions(kind)
        .iter()
        .map(|a| (a.sent, a.received, a.err_code, a.attempts))
        .collect()
}

#[test]
fn test_restart_after_commit_log_resumes_commit_actions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mnode");

    // Run until the commit log is durable
    let id = {
        let (_store, transport, manager) = open(&path);
        let mut record = manager.create(TransPolicy::Rollback, Some(Endpoint::new("client", 1)));
        record.add_resource("db:power").unwrap();
        record.append_redo_log(Bytes::from_static(b"redo")).unwrap();
        record.append_commit_log(Bytes::from_static(b"commit")).unwrap();
        record.append_redo_action(action(1, "create-vnode")).unwrap();
        record.append_redo_action(action(2, "create-vnode")).unwrap();
        record.append_commit_action(action(1, "sync-vnode")).unwrap();
        let id = manager.prepare_at(record, 1_000).unwrap();

        for sent in transport.take_sent() {
            manager
                .handle_action_rsp_at(sent.handle, code::SUCCESS, Bytes::new(), 1_001)
                .unwrap();
        }
        assert_eq!(manager.get(id).unwrap().stage, TransStage::CommitAction);
        id
        // crash: nothing is cleaned up
    };

    let (store, transport, manager) = open(&path);
    assert_eq!(manager.init_trans_at(5_000).unwrap(), 1);

    let record = manager.get(id).unwrap();
    assert_eq!(record.stage, TransStage::CommitAction);
    assert!(record.redo_actions.iter().all(|a| a.is_satisfied()));

    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_type.as_str(), "sync-vnode");
    assert_eq!(sent[0].handle.kind, ActionKind::Commit);

    // resources were re-acquired on restore
    let mut rival = manager.create(TransPolicy::Rollback, None);
    rival.add_resource("db:power").unwrap();
    assert!(manager.prepare_at(rival, 5_001).is_err());

    manager
        .handle_action_rsp_at(sent[0].handle, code::SUCCESS, Bytes::new(), 5_002)
        .unwrap();
    assert!(manager.is_empty());
    assert!(store.iterate_on_startup().unwrap().is_empty());

    let logs = store.read_logs().unwrap();
    assert_eq!(
        logs,
        vec![Bytes::from_static(b"redo"), Bytes::from_static(b"commit")]
    );
}

#[test]
fn test_mid_stage_snapshot_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mnode");

    let (id, before) = {
        let (_store, transport, manager) = open(&path);
        let mut record = manager.create(TransPolicy::Retry, None);
        record.set_name("create-stb").unwrap();
        record.append_redo_action(action(1, "create-stb")).unwrap();
        record.append_redo_action(action(2, "create-stb")).unwrap();
        record.append_redo_action(action(3, "create-stb")).unwrap();
        let id = manager.prepare_at(record, 1_000).unwrap();

        let sent = transport.take_sent();
        manager
            .handle_action_rsp_at(sent[0].handle, code::SUCCESS, Bytes::new(), 1_001)
            .unwrap();
        manager
            .handle_action_rsp_at(sent[1].handle, code::TIMEOUT, Bytes::new(), 1_002)
            .unwrap();
        (id, manager.get(id).unwrap())
    };

    // what is on disk matches what was in memory
    let store = RocksStore::open(&path).unwrap();
    let raw = store.load_trans(id).unwrap().unwrap();
    let stored = TransRecord::decode(&raw).unwrap();
    assert_eq!(stored.stage, before.stage);
    assert_eq!(stored.name, "create-stb");
    assert_eq!(
        status(&stored, ActionKind::Redo),
        status(&before, ActionKind::Redo)
    );
    drop(store);

    let (_store, transport, manager) = open(&path);
    manager.init_trans_at(9_000).unwrap();
    let restored = manager.get(id).unwrap();
    assert_eq!(restored.stage, TransStage::RedoAction);
    assert!(restored.redo_actions[0].is_satisfied());
    assert_eq!(restored.redo_actions[0].attempts, 1);

    // only the two unfinished actions are sent again
    let mut resent: Vec<u32> = transport
        .take_sent()
        .iter()
        .map(|s| s.handle.index)
        .collect();
    resent.sort_unstable();
    assert_eq!(resent, vec![1, 2]);
}

#[test]
fn test_ids_never_reused_across_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mnode");

    let finished_id = {
        let (_store, _transport, manager) = open(&path);
        let mut record = manager.create(TransPolicy::Rollback, None);
        record.append_redo_log(Bytes::from_static(b"redo")).unwrap();
        let id = manager.prepare_at(record, 1_000).unwrap();
        assert!(manager.is_empty());
        id
    };

    let (_store, _transport, manager) = open(&path);
    assert_eq!(manager.init_trans_at(2_000).unwrap(), 0);
    assert!(manager.create(TransPolicy::Rollback, None).id > finished_id);
}

#[test]
fn test_cleanup_keeps_durable_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mnode");

    let (store, _transport, manager) = open(&path);
    let mut record = manager.create(TransPolicy::Retry, None);
    record.add_resource("topic:t1").unwrap();
    record.append_redo_action(action(1, "create-topic")).unwrap();
    let id = manager.prepare_at(record, 1_000).unwrap();

    manager.cleanup_trans().unwrap();
    assert!(manager.is_empty());
    assert!(store.load_trans(id).unwrap().is_some());

    // the resource is free again until the record is restored
    assert_eq!(manager.init_trans_at(2_000).unwrap(), 1);
    let mut rival = manager.create(TransPolicy::Retry, None);
    rival.add_resource("topic:t1").unwrap();
    assert!(manager.prepare_at(rival, 2_001).is_err());
}
