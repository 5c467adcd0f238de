//! In-process transport that records sends instead of delivering them.
//! Replies are injected by whoever owns the transaction manager.

use crate::common::{Error, Result};
use crate::rpc::{RequestHandle, TransOutcome, Transport};
use crate::trans::action::{Endpoint, MsgType};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub endpoint: Endpoint,
    pub msg_type: MsgType,
    pub payload: Bytes,
    pub handle: RequestHandle,
}

#[derive(Debug, Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<SentRequest>>,
    notified: Mutex<Vec<(Endpoint, TransOutcome)>>,
    dead: Mutex<HashSet<Endpoint>>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send so far, oldest first
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Drain recorded sends
    pub fn take_sent(&self) -> Vec<SentRequest> {
        self.sent
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }

    pub fn sent_to(&self, endpoint: &Endpoint) -> usize {
        self.sent()
            .iter()
            .filter(|r| &r.endpoint == endpoint)
            .count()
    }

    pub fn notified(&self) -> Vec<(Endpoint, TransOutcome)> {
        self.notified.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn mark_dead(&self, endpoint: &Endpoint) {
        if let Ok(mut dead) = self.dead.lock() {
            dead.insert(endpoint.clone());
        }
    }

    pub fn mark_live(&self, endpoint: &Endpoint) {
        if let Ok(mut dead) = self.dead.lock() {
            dead.remove(endpoint);
        }
    }

    /// Reject all further sends
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Transport for LoopbackTransport {
    fn send_async(
        &self,
        endpoint: &Endpoint,
        msg_type: &MsgType,
        payload: Bytes,
        handle: RequestHandle,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("loopback transport closed".into()));
        }
        self.sent.lock()?.push(SentRequest {
            endpoint: endpoint.clone(),
            msg_type: msg_type.clone(),
            payload,
            handle,
        });
        Ok(())
    }

    fn notify(&self, origin: &Endpoint, outcome: &TransOutcome) -> Result<()> {
        self.notified.lock()?.push((origin.clone(), outcome.clone()));
        Ok(())
    }

    fn is_live(&self, endpoint: &Endpoint) -> bool {
        self.dead
            .lock()
            .map(|dead| !dead.contains(endpoint))
            .unwrap_or(true)
    }
}
