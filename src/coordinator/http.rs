//! Admin HTTP API for the coordinator
//!
//! - `GET /health`
//! - `GET /trans`: live transactions
//! - `GET /trans/:id`: one transaction with per-action status
//! - `POST /trans/:id/cancel`
//! - `DELETE /trans/:id`: drop a stalled transaction

use crate::common::Error;
use crate::trans::{ActionKind, TransAction, TransId, TransManager, TransRecord};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared coordinator state for HTTP handlers.
#[derive(Clone)]
pub struct CoordState {
    pub manager: Arc<TransManager>,
    pub node_id: String,
}

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trans", get(list_trans))
        .route("/trans/:id", get(get_trans).delete(drop_trans))
        .route("/trans/:id/cancel", post(cancel_trans))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: Error) -> Response {
    (
        e.to_http_status(),
        axum::Json(json!({ "error": e.to_string(), "code": e.code() })),
    )
        .into_response()
}

fn action_json(index: usize, action: &TransAction) -> serde_json::Value {
    json!({
        "index": index,
        "msg_type": action.msg_type.as_str(),
        "endpoint": action.ep_set.current().map(|e| e.to_string()),
        "sent": action.sent,
        "received": action.received,
        "err_code": action.err_code,
        "attempts": action.attempts,
        "payload_len": action.payload.len(),
    })
}

fn record_json(record: &TransRecord) -> serde_json::Value {
    let actions = |kind: ActionKind| -> Vec<serde_json::Value> {
        record
            .actions(kind)
            .iter()
            .enumerate()
            .map(|(i, a)| action_json(i, a))
            .collect()
    };
    json!({
        "id": record.id,
        "name": record.name,
        "policy": record.policy.as_str(),
        "stage": record.stage.as_str(),
        "resources": record.resources,
        "origin": record.origin.as_ref().map(|e| e.to_string()),
        "redo_logs": record.redo_logs.len(),
        "undo_logs": record.undo_logs.len(),
        "commit_logs": record.commit_logs.len(),
        "redo_actions": actions(ActionKind::Redo),
        "undo_actions": actions(ActionKind::Undo),
        "commit_actions": actions(ActionKind::Commit),
        "created_at": crate::common::format_timestamp_millis(record.created_at),
        "last_exec_at": crate::common::format_timestamp_millis(record.last_exec_at),
        "failed_times": record.failed_times,
        "cancel_requested": record.cancel_requested,
        "stalled": record.stalled,
        "admitted": record.admitted,
        "last_error": record.last_error,
    })
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "node_id": state.node_id,
        "transactions": state.manager.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_trans(State(state): State<CoordState>) -> Response {
    match state.manager.list() {
        Ok(list) => (
            StatusCode::OK,
            axum::Json(json!({ "total": list.len(), "transactions": list })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_trans(State(state): State<CoordState>, Path(id): Path<TransId>) -> Response {
    match state.manager.get(id) {
        Ok(record) => (StatusCode::OK, axum::Json(record_json(&record))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_trans(State(state): State<CoordState>, Path(id): Path<TransId>) -> Response {
    match state.manager.cancel(id) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            axum::Json(json!({ "status": "cancel_requested", "id": id })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn drop_trans(State(state): State<CoordState>, Path(id): Path<TransId>) -> Response {
    match state.manager.drop_trans(id) {
        Ok(()) => {
            tracing::info!(trans_id = id, "transaction dropped via admin API");
            (
                StatusCode::OK,
                axum::Json(json!({ "status": "dropped", "id": id })),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TransConfig;
    use crate::rpc::LoopbackTransport;
    use crate::store::MemStore;
    use crate::trans::{Endpoint, MsgType, TransPolicy};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<TransManager>) {
        let manager = Arc::new(
            TransManager::new(
                TransConfig::default(),
                Arc::new(MemStore::new()),
                Arc::new(LoopbackTransport::new()),
            )
            .unwrap(),
        );
        let router = create_router(CoordState {
            manager: manager.clone(),
            node_id: "mnode-test".into(),
        });
        (router, manager)
    }

    fn running(manager: &TransManager, policy: TransPolicy) -> TransId {
        let mut record = manager.create(policy, None);
        record.set_name("create-stb").unwrap();
        record
            .append_redo_action(TransAction::new(
                Endpoint::new("dnode-1", 6030),
                MsgType::new("create-stb"),
                bytes::Bytes::from_static(b"x"),
            ))
            .unwrap();
        manager.prepare(record).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 50_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["node_id"], "mnode-test");
        assert_eq!(json["transactions"], 0);
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let (app, manager) = test_app();
        let id = running(&manager, TransPolicy::Retry);

        let resp = app
            .clone()
            .oneshot(Request::get("/trans").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["transactions"][0]["stage"], "redo-action");

        let resp = app
            .oneshot(
                Request::get(format!("/trans/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["name"], "create-stb");
        assert_eq!(json["stage"], "redo-action");
        assert_eq!(json["redo_actions"][0]["endpoint"], "dnode-1:6030");
        assert_eq!(json["redo_actions"][0]["attempts"], 1);
    }

    #[tokio::test]
    async fn test_get_unknown_is_404() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(Request::get("/trans/404").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_then_drop() {
        let (app, manager) = test_app();
        let id = running(&manager, TransPolicy::Retry);

        let resp = app
            .clone()
            .oneshot(
                Request::delete(format!("/trans/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(
                Request::post(format!("/trans/{}/cancel", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        manager.sweep().unwrap();
        assert!(manager.get(id).unwrap().stalled);

        let resp = app
            .oneshot(
                Request::delete(format!("/trans/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(manager.is_empty());
    }
}
