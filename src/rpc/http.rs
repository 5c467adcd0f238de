//! HTTP transport: each action is a `POST http://{endpoint}/rpc/{msg_type}`.
//!
//! Workers answer with the reply body and an optional `x-result-code` header.
//! Without the header the HTTP status is mapped onto a result code.

use crate::common::{Error, Result};
use crate::rpc::{ActionResponse, RequestHandle, TransOutcome, Transport};
use crate::trans::action::{Endpoint, MsgType};
use crate::trans::code;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub const RESULT_CODE_HEADER: &str = "x-result-code";
pub const TRANS_ID_HEADER: &str = "x-trans-id";

pub struct HttpTransport {
    client: reqwest::Client,
    runtime: Handle,
    replies: mpsc::UnboundedSender<ActionResponse>,
    timeout: Duration,
}

impl HttpTransport {
    /// Must be called from within a tokio runtime; replies are pushed to `replies`
    pub fn new(replies: mpsc::UnboundedSender<ActionResponse>, timeout: Duration) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Transport(format!("no tokio runtime: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            client,
            runtime,
            replies,
            timeout,
        })
    }
}

/// Result code for a worker reply
pub fn code_from_reply(status: StatusCode, header: Option<&str>) -> i32 {
    if let Some(code) = header.and_then(|h| h.trim().parse::<i32>().ok()) {
        return code;
    }
    match status {
        s if s.is_success() => code::SUCCESS,
        StatusCode::MISDIRECTED_REQUEST | StatusCode::TEMPORARY_REDIRECT => code::NOT_LEADER,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => code::OVERLOADED,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => code::TIMEOUT,
        s => 0x1000 | i32::from(s.as_u16()),
    }
}

fn code_from_error(e: &reqwest::Error) -> i32 {
    if e.is_timeout() {
        code::TIMEOUT
    } else {
        code::NETWORK_UNAVAILABLE
    }
}

impl Transport for HttpTransport {
    fn send_async(
        &self,
        endpoint: &Endpoint,
        msg_type: &MsgType,
        payload: Bytes,
        handle: RequestHandle,
    ) -> Result<()> {
        if self.replies.is_closed() {
            return Err(Error::Transport("reply channel closed".into()));
        }
        let url = format!("http://{}/rpc/{}", endpoint, msg_type);
        let request = self
            .client
            .post(url.clone())
            .header(TRANS_ID_HEADER, handle.trans_id.to_string())
            .body(payload);
        let replies = self.replies.clone();

        self.runtime.spawn(async move {
            let (code, reply) = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let header = resp
                        .headers()
                        .get(RESULT_CODE_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let code = code_from_reply(status, header.as_deref());
                    match resp.bytes().await {
                        Ok(body) => (code, body),
                        Err(e) => (code_from_error(&e), Bytes::new()),
                    }
                }
                Err(e) => {
                    tracing::debug!(url = %url, "rpc send failed: {}", e);
                    (code_from_error(&e), Bytes::new())
                }
            };
            let _ = replies.send(ActionResponse {
                handle,
                code,
                reply,
            });
        });
        Ok(())
    }

    fn notify(&self, origin: &Endpoint, outcome: &TransOutcome) -> Result<()> {
        let body = serde_json::to_vec(outcome).map_err(|e| Error::Internal(e.to_string()))?;
        let url = format!("http://{}/trans/outcome", origin);
        let request = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body);
        let trans_id = outcome.trans_id;

        self.runtime.spawn(async move {
            if let Err(e) = request.send().await {
                tracing::warn!(trans_id = trans_id, url = %url, "outcome notification failed: {}", e);
            }
        });
        Ok(())
    }
}
