//! Transaction engine
//!
//! A transaction is a set of redo/undo/commit logs plus the remote actions
//! that make them true on worker nodes. The stage machine in [`stage`] moves
//! it from creation to a terminal stage, the [`dispatcher`] sends actions and
//! folds replies back, and the [`TransManager`] owns every live record.

pub mod action;
pub mod code;
pub mod conflict;
pub mod dispatcher;
pub mod manager;
pub mod record;
pub mod stage;

pub use action::{ActionKind, Endpoint, EpSet, MsgType, TransAction};
pub use conflict::{AdmissionTable, ConflictTable};
pub use manager::{start_response_loop, start_sweeper, TransManager, TransSummary};
pub use record::{LastError, TransId, TransPolicy, TransRecord};
pub use stage::{policy_str, stage_str, TransEvent, TransStage};
