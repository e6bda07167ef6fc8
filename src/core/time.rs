//! Shared timestamp/id helpers for ledger records.

use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Milliseconds since the unix epoch.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Renders epoch milliseconds as `<secs>.<millis>Z` for operator output.
pub fn format_epoch_ms(ms: u64) -> String {
    format!("{}.{:03}Z", ms / 1000, ms % 1000)
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}
