//! Utility functions for minitrans

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a millisecond timestamp as RFC 3339 for admin listings
pub fn format_timestamp_millis(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Exponential backoff for the `attempt`-th retry (1-based), capped at
/// `max_ms`, with up to 10% random jitter on top of the base delay.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1u64 << shift).min(max_ms);
    let jitter = if delay >= 10 {
        rand::random::<u64>() % (delay / 10)
    } else {
        0
    };
    delay + jitter
}

/// Validate a conflict resource name (non-empty, bounded, printable)
pub fn validate_resource(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidState(
            "resource name cannot be empty".into(),
        ));
    }

    if name.len() > 256 {
        return Err(crate::Error::InvalidState(
            "resource name too long (max 256 bytes)".into(),
        ));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidState(
            "resource name contains invalid characters".into(),
        ));
    }

    Ok(())
}
