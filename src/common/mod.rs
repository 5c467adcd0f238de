//! Common utilities and types shared across minitrans

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, CoordinatorConfig, TransConfig};
pub use error::{Error, Result};
pub use utils::{backoff_delay_ms, crc32, format_timestamp_millis, timestamp_now_millis};
