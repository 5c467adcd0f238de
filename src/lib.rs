//! # minitrans
//!
//! Transaction coordinator for a clustered metadata node:
//! - Multi-step operations split into redo, commit and undo logs plus remote
//!   actions on worker nodes
//! - Atomic log batches with the transaction snapshot, so a restart resumes
//!   every transaction at the stage it reached
//! - Retry with backoff, endpoint redirects and rollback before the commit
//!   point
//! - Resource admission so overlapping transactions never run together
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!  caller ── create/prepare ──┐
//!                             ▼
//!                     ┌───────────────┐   atomic batches   ┌───────────┐
//!                     │ TransManager  │ ─────────────────▶ │ MetaStore │
//!                     │  stage driver │ ◀── apply (ack) ── │ (RocksDB) │
//!                     └──────┬────────┘                    └───────────┘
//!               send_async   │  ▲  ActionResponse
//!                            ▼  │
//!                     ┌───────────────┐
//!                     │   Transport   │ ── POST /rpc/{msg_type} ──▶ workers
//!                     └───────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! minitrans-coord serve \
//!   --id mnode-1 \
//!   --bind 0.0.0.0:6030 \
//!   --db ./mnode-data
//!
//! curl http://localhost:6030/trans
//! curl -X POST http://localhost:6030/trans/12/cancel
//! ```

pub mod common;
pub mod coordinator;
pub mod rpc;
pub mod store;
pub mod trans;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use trans::{TransManager, TransPolicy, TransRecord, TransStage};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
