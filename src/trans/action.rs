//! Remote actions and their endpoint sets

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network address of a worker node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::InvalidConfig(format!("endpoint without port: {}", s)))?;
        let port = port
            .parse()
            .map_err(|_| crate::Error::InvalidConfig(format!("invalid endpoint port: {}", s)))?;
        if host.is_empty() {
            return Err(crate::Error::InvalidConfig(format!("empty endpoint host: {}", s)));
        }
        Ok(Self::new(host, port))
    }
}

/// Ordered candidate endpoints for one target node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpSet {
    pub in_use: usize,
    pub eps: Vec<Endpoint>,
}

impl EpSet {
    pub fn new(eps: Vec<Endpoint>) -> Self {
        Self { in_use: 0, eps }
    }

    pub fn current(&self) -> Option<&Endpoint> {
        self.eps.get(self.in_use)
    }

    /// Move to the next candidate, wrapping around
    pub fn advance(&mut self) {
        if !self.eps.is_empty() {
            self.in_use = (self.in_use + 1) % self.eps.len();
        }
    }

    /// First endpoint accepted by `is_live`, starting from the one in use.
    /// Updates `in_use` to the chosen endpoint.
    pub fn select_live(&mut self, is_live: impl Fn(&Endpoint) -> bool) -> Option<&Endpoint> {
        let len = self.eps.len();
        let start = self.in_use.min(len.saturating_sub(1));
        let pick = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| is_live(&self.eps[i]))?;
        self.in_use = pick;
        self.eps.get(pick)
    }
}

impl From<Endpoint> for EpSet {
    fn from(ep: Endpoint) -> Self {
        Self::new(vec![ep])
    }
}

/// RPC operation invoked on the remote node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgType(pub String);

impl MsgType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which action list of a transaction an action belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Redo,
    Undo,
    Commit,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Redo => write!(f, "redo"),
            ActionKind::Undo => write!(f, "undo"),
            ActionKind::Commit => write!(f, "commit"),
        }
    }
}

/// One remote step of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransAction {
    pub ep_set: EpSet,
    pub msg_type: MsgType,
    pub sent: bool,
    pub received: bool,
    pub err_code: i32,
    pub payload: Bytes,
    /// Number of sends so far
    pub attempts: u32,
    /// Bumped on every send; replies carrying an older epoch are stale
    pub epoch: u32,
    pub last_sent_at: u64,
    /// Earliest time a transient failure may be re-sent (0 = no backoff)
    pub retry_at: u64,
}

impl TransAction {
    pub fn new(ep_set: impl Into<EpSet>, msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self {
            ep_set: ep_set.into(),
            msg_type,
            sent: false,
            received: false,
            err_code: 0,
            payload: payload.into(),
            attempts: 0,
            epoch: 0,
            last_sent_at: 0,
            retry_at: 0,
        }
    }

    /// Terminal success; never dispatched again
    pub fn is_satisfied(&self) -> bool {
        self.received && self.err_code == 0
    }

    /// Terminal failure reply
    pub fn is_failed(&self) -> bool {
        self.received && self.err_code != 0
    }

    pub fn is_in_flight(&self) -> bool {
        self.sent && !self.received
    }

    /// Forget an in-flight send so the next sweep sends again
    pub fn reset_in_flight(&mut self) {
        if self.is_in_flight() {
            self.sent = false;
            self.retry_at = 0;
        }
    }
}
