//! Coordinator node
//!
//! The coordinator is responsible for:
//! - Opening the metadata store and recovering unfinished transactions
//! - Running the sweeper and the reply loop
//! - Serving the admin HTTP API

pub mod http;
pub mod server;

pub use server::Coordinator;
