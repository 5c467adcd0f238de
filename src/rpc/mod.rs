//! RPC transport interface
//!
//! The coordinator only needs fire-and-forget sends; replies come back later
//! as [`ActionResponse`]s routed to
//! [`TransManager::handle_action_rsp`](crate::trans::TransManager::handle_action_rsp).

pub mod http;
pub mod loopback;

use crate::common::Result;
use crate::trans::action::{ActionKind, Endpoint, MsgType};
use crate::trans::record::TransId;
use crate::trans::stage::TransStage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use http::HttpTransport;
pub use loopback::LoopbackTransport;

/// Identifies which send a reply belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestHandle {
    pub trans_id: TransId,
    pub kind: ActionKind,
    pub index: u32,
    pub epoch: u32,
}

/// Reply (or synthesized timeout) for one send
#[derive(Debug, Clone)]
pub struct ActionResponse {
    pub handle: RequestHandle,
    pub code: i32,
    pub reply: Bytes,
}

/// Final result delivered to a transaction's origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransOutcome {
    pub trans_id: TransId,
    pub name: String,
    pub stage: TransStage,
    pub code: i32,
    pub message: String,
}

pub trait Transport: Send + Sync {
    /// Queue `payload` for `endpoint` and return immediately.
    ///
    /// # Errors
    ///
    /// Only local failures (transport shut down, no runtime); remote failures
    /// arrive as an [`ActionResponse`] with a non-zero code.
    fn send_async(
        &self,
        endpoint: &Endpoint,
        msg_type: &MsgType,
        payload: Bytes,
        handle: RequestHandle,
    ) -> Result<()>;

    /// Deliver the final outcome of a transaction to its origin
    fn notify(&self, origin: &Endpoint, outcome: &TransOutcome) -> Result<()>;

    /// Whether `endpoint` is worth trying right now
    fn is_live(&self, _endpoint: &Endpoint) -> bool {
        true
    }
}
